//! Server-side token encoders.
//!
//! The protocol crate only encodes what a client sends plus a few token
//! bodies; the rest of what a server writes is assembled here.

use bytes::{BufMut, BytesMut};
use tds_protocol::codec::{write_b_varchar, write_utf16_string};
use tds_protocol::{
    DoneStatus, EnvChange, FedAuthInfo, LoginAck, ProtocolError, ServerMessage, TdsVersion,
    TokenType, TypeId,
};

/// `cur_cmd` reported in DONE tokens (SELECT).
const CUR_CMD_SELECT: u16 = 0xC1;

/// DONE, DONEPROC or DONEINPROC; the row count is 4 bytes before TDS 7.2.
pub fn done(dst: &mut BytesMut, token: TokenType, status: DoneStatus, rows: u64, version: TdsVersion) {
    dst.put_u8(token as u8);
    dst.put_u16_le(status.bits());
    dst.put_u16_le(CUR_CMD_SELECT);
    if version.is_legacy() {
        dst.put_u32_le(rows as u32);
    } else {
        dst.put_u64_le(rows);
    }
}

/// A final DONE carrying a row count.
pub fn done_count(dst: &mut BytesMut, rows: u64, version: TdsVersion) {
    done(dst, TokenType::Done, DoneStatus::COUNT, rows, version);
}

/// ERROR token.
pub fn error(dst: &mut BytesMut, number: i32, class: u8, message: &str) -> Result<(), ProtocolError> {
    dst.put_u8(TokenType::Error as u8);
    ServerMessage {
        number,
        state: 1,
        class,
        message: message.to_owned(),
        server: "mock".into(),
        procedure: String::new(),
        line: 1,
    }
    .encode(dst)
}

/// ENVCHANGE token.
pub fn env_change(dst: &mut BytesMut, change: &EnvChange) -> Result<(), ProtocolError> {
    dst.put_u8(TokenType::EnvChange as u8);
    change.encode(dst)
}

/// LOGINACK token.
pub fn login_ack(dst: &mut BytesMut, version: TdsVersion, server_name: &str) -> Result<(), ProtocolError> {
    dst.put_u8(TokenType::LoginAck as u8);
    LoginAck {
        interface: 1,
        tds_version: version,
        prog_name: server_name.to_owned(),
        prog_version: 0x1000_0000,
    }
    .encode(dst)
}

/// A result set of non-nullable INT columns.
pub fn int_rows(
    dst: &mut BytesMut,
    columns: &[String],
    rows: &[Vec<i32>],
    version: TdsVersion,
) -> Result<(), ProtocolError> {
    dst.put_u8(TokenType::ColMetaData as u8);
    dst.put_u16_le(columns.len() as u16);
    for name in columns {
        if version.has_wide_user_type() {
            dst.put_u32_le(0);
        } else {
            dst.put_u16_le(0);
        }
        dst.put_u16_le(0);
        dst.put_u8(TypeId::Int as u8);
        write_b_varchar(dst, name)?;
    }
    for row in rows {
        dst.put_u8(TokenType::Row as u8);
        for value in row {
            dst.put_i32_le(*value);
        }
    }
    done_count(dst, rows.len() as u64, version);
    Ok(())
}

/// RETURNVALUE token for an INT output parameter.
pub fn int_return_value(
    dst: &mut BytesMut,
    name: &str,
    value: i32,
    version: TdsVersion,
) -> Result<(), ProtocolError> {
    dst.put_u8(TokenType::ReturnValue as u8);
    dst.put_u16_le(0);
    write_b_varchar(dst, name)?;
    dst.put_u8(0x01);
    if version.has_wide_user_type() {
        dst.put_u32_le(0);
    } else {
        dst.put_u16_le(0);
    }
    // Nullable.
    dst.put_u16_le(0x0001);
    dst.put_u8(TypeId::IntN as u8);
    dst.put_u8(4);
    dst.put_u8(4);
    dst.put_i32_le(value);
    Ok(())
}

/// SSPI token carrying an NTLM CHALLENGE message.
pub fn ntlm_challenge(dst: &mut BytesMut, server_challenge: [u8; 8]) {
    let mut message = BytesMut::with_capacity(48);
    message.put_slice(b"NTLMSSP\0");
    message.put_u32_le(2);
    // Empty target name at the end of the message.
    message.put_u16_le(0);
    message.put_u16_le(0);
    message.put_u32_le(48);
    // NEGOTIATE_UNICODE | NEGOTIATE_NTLM | NEGOTIATE_TARGET_INFO
    message.put_u32_le(0x0000_0001 | 0x0000_0200 | 0x0080_0000);
    message.put_slice(&server_challenge);
    message.put_u64_le(0);
    // Empty target info.
    message.put_u16_le(0);
    message.put_u16_le(0);
    message.put_u32_le(48);

    dst.put_u8(TokenType::Sspi as u8);
    dst.put_u16_le(message.len() as u16);
    dst.put_slice(&message);
}

/// FEDAUTHINFO token.
pub fn fedauth_info(dst: &mut BytesMut, sts_url: &str, spn: &str) {
    dst.put_u8(TokenType::FedAuthInfo as u8);
    FedAuthInfo {
        sts_url: Some(sts_url.to_owned()),
        spn: Some(spn.to_owned()),
    }
    .encode(dst);
}

/// UTF-16LE bytes of `s`, as found in SQL batch payloads.
pub fn utf16(s: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(s.len() * 2);
    write_utf16_string(&mut buf, s);
    buf
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{Token, TokenParser};

    #[test]
    fn test_int_rows_parse_back() {
        let mut buf = BytesMut::new();
        int_rows(&mut buf, &["n".into()], &[vec![1], vec![2]], TdsVersion::V7_4).unwrap();

        let mut parser = TokenParser::new(buf.freeze(), TdsVersion::V7_4);
        assert!(matches!(parser.next_token().unwrap(), Some(Token::ColMetaData(_))));
        let Some(Token::Row(row)) = parser.next_token().unwrap() else {
            unreachable!("expected a row");
        };
        assert_eq!(row.get(0).unwrap().as_ref(), &1i32.to_le_bytes());
        assert!(matches!(parser.next_token().unwrap(), Some(Token::Row(_))));
        let Some(Token::Done(done)) = parser.next_token().unwrap() else {
            unreachable!("expected DONE");
        };
        assert_eq!(done.count(), Some(2));
    }

    #[test]
    fn test_return_value_parses_back() {
        let mut buf = BytesMut::new();
        int_return_value(&mut buf, "@handle", 7, TdsVersion::V7_4).unwrap();
        let mut parser = TokenParser::new(buf.freeze(), TdsVersion::V7_4);
        let Some(Token::ReturnValue(value)) = parser.next_token().unwrap() else {
            unreachable!("expected RETURNVALUE");
        };
        assert_eq!(value.name, "@handle");
        assert_eq!(value.value.unwrap().as_ref(), &7i32.to_le_bytes());
    }

    #[test]
    fn test_legacy_done_is_shorter() {
        let mut modern = BytesMut::new();
        done_count(&mut modern, 1, TdsVersion::V7_4);
        let mut legacy = BytesMut::new();
        done_count(&mut legacy, 1, TdsVersion::V7_1);
        assert_eq!(modern.len(), 13);
        assert_eq!(legacy.len(), 9);
    }
}
