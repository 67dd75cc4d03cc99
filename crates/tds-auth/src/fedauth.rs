//! Federated authentication payloads.
//!
//! Two pieces travel on the wire: the FEDAUTH feature extension inside
//! LOGIN7 (feature id 0x02) and, for ADAL workflows, the FEDAUTH_TOKEN
//! message sent once the server has answered with FEDAUTHINFO.

use bytes::{BufMut, Bytes, BytesMut};

use crate::authentication::Authentication;

/// LOGIN7 feature id for federated authentication.
pub const FEATURE_ID: u8 = 0x02;

/// Federated authentication library announced in the feature extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FedAuthLibrary {
    /// The token is embedded in LOGIN7.
    SecurityToken = 0x01,
    /// The token is fetched after FEDAUTHINFO.
    Adal = 0x02,
}

/// ADAL workflow byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FedAuthWorkflow {
    /// User name and password.
    UserPass = 0x01,
    /// Integrated (managed identity, service principal, environment).
    Integrated = 0x02,
}

/// Build the FEDAUTH feature extension data for `auth`.
///
/// `echo` repeats the FEDAUTHREQUIRED answer from the server's PRELOGIN.
/// Returns `None` for variants that do not use federated authentication.
#[must_use]
pub fn feature_data(auth: &Authentication, echo: bool) -> Option<Bytes> {
    let echo_bit = u8::from(echo);
    match auth {
        Authentication::AzureAdAccessToken { token } => {
            let token = utf16le(token);
            let mut buf = BytesMut::with_capacity(5 + token.len());
            buf.put_u8(((FedAuthLibrary::SecurityToken as u8) << 1) | echo_bit);
            buf.put_u32_le(token.len() as u32);
            buf.put_slice(&token);
            Some(buf.freeze())
        }
        other => {
            let workflow = other.fedauth_workflow()?;
            let mut buf = BytesMut::with_capacity(2);
            buf.put_u8(((FedAuthLibrary::Adal as u8) << 1) | echo_bit);
            buf.put_u8(workflow as u8);
            Some(buf.freeze())
        }
    }
}

/// Build the body of a FEDAUTH_TOKEN message.
///
/// Layout: total data length (u32), token length (u32), UTF-16LE token.
/// No nonce is sent.
#[must_use]
pub fn token_message(token: &str) -> Bytes {
    let token = utf16le(token);
    let mut buf = BytesMut::with_capacity(8 + token.len());
    buf.put_u32_le(token.len() as u32 + 4);
    buf.put_u32_le(token.len() as u32);
    buf.put_slice(&token);
    buf.freeze()
}

/// The OAuth scope for a server-provided SPN.
#[must_use]
pub fn scope_for_spn(spn: &str) -> String {
    format!("{}/.default", spn.trim_end_matches('/'))
}

pub(crate) fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::authentication::{AuthenticationBuilder, AuthenticationType};

    #[test]
    fn test_security_token_feature() {
        let auth = Authentication::access_token("ab");
        let data = feature_data(&auth, true).unwrap();
        assert_eq!(data[0], 0x03);
        assert_eq!(&data[1..5], &4u32.to_le_bytes());
        assert_eq!(&data[5..], &[b'a', 0, b'b', 0]);
    }

    #[test]
    fn test_adal_feature() {
        let auth = AuthenticationBuilder::new(AuthenticationType::AzureAdMsiVm)
            .build()
            .unwrap();
        let data = feature_data(&auth, false).unwrap();
        assert_eq!(&data[..], &[0x04, 0x02]);

        let password = AuthenticationBuilder::new(AuthenticationType::AzureAdPassword)
            .username("u")
            .password("p")
            .client_id("c")
            .build()
            .unwrap();
        assert_eq!(&feature_data(&password, true).unwrap()[..], &[0x05, 0x01]);
    }

    #[test]
    fn test_no_feature_for_sql_auth() {
        assert!(feature_data(&Authentication::sql("sa", "pw"), false).is_none());
    }

    #[test]
    fn test_token_message_layout() {
        let msg = token_message("tok");
        assert_eq!(&msg[0..4], &10u32.to_le_bytes());
        assert_eq!(&msg[4..8], &6u32.to_le_bytes());
        assert_eq!(msg.len(), 14);
    }

    #[test]
    fn test_scope_for_spn() {
        assert_eq!(
            scope_for_spn("https://database.windows.net/"),
            "https://database.windows.net/.default"
        );
        assert_eq!(
            scope_for_spn("https://database.windows.net"),
            "https://database.windows.net/.default"
        );
    }
}
