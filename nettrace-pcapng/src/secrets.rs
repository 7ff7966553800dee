//! Decryption secrets embedded in the trace

use std::fmt;

/// Kind of session secrets a traced process can export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretsKind {
    /// NSS key log format written by TLS libraries
    TlsKeyLog,
    /// WireGuard key log
    WireGuardKeyLog,
}

impl SecretsKind {
    /// All supported kinds
    pub const ALL: [SecretsKind; 2] = [SecretsKind::TlsKeyLog, SecretsKind::WireGuardKeyLog];

    /// Secrets type identifier stored in the decryption secrets block
    pub const fn secrets_type(self) -> u32 {
        match self {
            SecretsKind::TlsKeyLog => 0x544c_534b,
            SecretsKind::WireGuardKeyLog => 0x5747_4b4c,
        }
    }

    /// Environment variable a child process reads to find its key log file
    pub const fn env_var(self) -> &'static str {
        match self {
            SecretsKind::TlsKeyLog => "SSLKEYLOGFILE",
            SecretsKind::WireGuardKeyLog => "WG_KEYLOGFILE",
        }
    }
}

impl fmt::Display for SecretsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretsKind::TlsKeyLog => write!(f, "tls"),
            SecretsKind::WireGuardKeyLog => write!(f, "wireguard"),
        }
    }
}

/// Encode the body of a decryption secrets block (little endian)
///
/// Layout: secrets type, secrets length, secrets data padded to 32 bits.
pub(crate) fn encode_secrets_body(kind: SecretsKind, secrets: &[u8]) -> Vec<u8> {
    let pad_len = (4 - secrets.len() % 4) % 4;
    let mut body = Vec::with_capacity(8 + secrets.len() + pad_len);
    body.extend_from_slice(&kind.secrets_type().to_le_bytes());
    body.extend_from_slice(&(secrets.len() as u32).to_le_bytes());
    body.extend_from_slice(secrets);
    body.resize(body.len() + pad_len, 0);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_types() {
        assert_eq!(SecretsKind::TlsKeyLog.secrets_type(), 0x544c534b);
        assert_eq!(SecretsKind::WireGuardKeyLog.secrets_type(), 0x57474b4c);
        assert_eq!(SecretsKind::TlsKeyLog.env_var(), "SSLKEYLOGFILE");
        assert_eq!(SecretsKind::WireGuardKeyLog.env_var(), "WG_KEYLOGFILE");
    }

    #[test]
    fn test_body_is_padded() {
        let body = encode_secrets_body(SecretsKind::TlsKeyLog, b"CLIENT_RANDOM a b\n");
        // 8 header bytes + 18 data bytes + 2 padding
        assert_eq!(body.len(), 28);
        assert_eq!(&body[0..4], &0x544c534bu32.to_le_bytes());
        assert_eq!(&body[4..8], &18u32.to_le_bytes());
        assert_eq!(&body[26..], &[0, 0]);
    }

    #[test]
    fn test_aligned_body_not_padded() {
        let body = encode_secrets_body(SecretsKind::WireGuardKeyLog, b"abcd");
        assert_eq!(body.len(), 12);
    }
}
