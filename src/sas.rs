//! Shared access signature tokens for IoT hub device authentication.
//!
//! A token signs `<url-encoded resource>\n<expiry>` with HMAC-SHA256 using the
//! device's base64 `SharedAccessKey`:
//!
//! ```text
//! SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>
//! ```

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::registry::ConnectError;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of each generated token.
pub const TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Tokens are renewed this long before they expire.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Decoded device key able to mint tokens for one resource.
#[derive(Clone)]
pub struct SasSigner {
    resource_uri: String,
    mac: HmacSha256,
}

impl SasSigner {
    /// Create a signer for `<host_name>/devices/<device_id>`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::InvalidConnectionString` if the key is not
    /// valid base64 or is empty.
    pub fn new(host_name: &str, device_id: &str, shared_access_key: &str) -> Result<Self, ConnectError> {
        let key = STANDARD.decode(shared_access_key.trim()).map_err(|_| {
            ConnectError::InvalidConnectionString("SharedAccessKey is not valid base64".to_string())
        })?;

        if key.is_empty() {
            return Err(ConnectError::InvalidConnectionString(
                "SharedAccessKey is empty".to_string(),
            ));
        }

        let mac = HmacSha256::new_from_slice(&key).map_err(|_| {
            ConnectError::InvalidConnectionString("SharedAccessKey is not a usable HMAC key".to_string())
        })?;

        Ok(Self {
            resource_uri: format!("{}/devices/{}", host_name, device_id),
            mac,
        })
    }

    /// Token expiring at `expiry` (seconds since the Unix epoch).
    pub fn token_at(&self, expiry: i64) -> String {
        let resource = urlencoding::encode(&self.resource_uri);
        let string_to_sign = format!("{}\n{}", resource, expiry);

        let mut mac = self.mac.clone();
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        format!(
            "SharedAccessSignature sr={}&sig={}&se={}",
            resource,
            urlencoding::encode(&signature),
            expiry
        )
    }

    /// Fresh token valid for [`TOKEN_TTL`], with its expiry.
    pub fn token(&self) -> (String, i64) {
        let expiry = Utc::now().timestamp() + TOKEN_TTL.as_secs() as i64;
        (self.token_at(expiry), expiry)
    }
}

impl std::fmt::Debug for SasSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasSigner")
            .field("resource_uri", &self.resource_uri)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Whether a token expiring at `expiry` is due for renewal at `now`.
pub fn needs_refresh(expiry: i64, now: i64) -> bool {
    now >= expiry - REFRESH_MARGIN.as_secs() as i64
}
