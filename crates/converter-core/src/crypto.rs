//! Message decryption contract.
//!
//! Cryptographic primitives live outside this crate. A source without
//! encryption settings gets a [`PassThroughDecryptor`]; sources that do
//! configure encryption need a [`DecryptorFactory`] that knows how to build
//! a real one.

use crate::config::EncryptionConfig;
use crate::error::DecryptError;
use crate::message::RawdataMessage;
use std::sync::Arc;

/// Decrypts message entries.
pub trait Decryptor: Send + Sync {
    /// Whether decryption is configured. Failures of an inactive decryptor
    /// are treated as "content was not encrypted".
    fn is_active(&self) -> bool;

    /// Return a decrypted copy of the message.
    fn try_decrypt(&self, message: &RawdataMessage) -> Result<RawdataMessage, DecryptError>;
}

/// Decryptor that returns messages unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughDecryptor;

impl Decryptor for PassThroughDecryptor {
    fn is_active(&self) -> bool {
        false
    }

    fn try_decrypt(&self, message: &RawdataMessage) -> Result<RawdataMessage, DecryptError> {
        Ok(message.clone())
    }
}

/// Builds the decryptor for a rawdata source.
pub trait DecryptorFactory: Send + Sync {
    fn create(
        &self,
        source: &str,
        encryption: &EncryptionConfig,
    ) -> Result<Arc<dyn Decryptor>, DecryptError>;
}

/// Factory that only supports unencrypted sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecryptorFactory;

impl DecryptorFactory for DefaultDecryptorFactory {
    fn create(
        &self,
        source: &str,
        encryption: &EncryptionConfig,
    ) -> Result<Arc<dyn Decryptor>, DecryptError> {
        if encryption.is_configured() {
            return Err(DecryptError::Setup(format!(
                "rawdata source '{}' is encrypted but no decryptor implementation is available",
                source
            )));
        }
        Ok(Arc::new(PassThroughDecryptor))
    }
}

/// Result of running a message through a decryptor.
#[derive(Debug)]
pub enum Decrypted {
    /// Content was decrypted (or the decryptor is a no-op)
    Message(RawdataMessage),
    /// Decryption failed on an inactive decryptor; the original is kept
    PassedThrough(RawdataMessage),
}

impl Decrypted {
    pub fn into_message(self) -> RawdataMessage {
        match self {
            Decrypted::Message(m) | Decrypted::PassedThrough(m) => m,
        }
    }
}

/// Decrypt a message. Failures are fatal only when the decryptor is active.
pub fn decrypt(decryptor: &dyn Decryptor, message: RawdataMessage) -> Result<Decrypted, DecryptError> {
    match decryptor.try_decrypt(&message) {
        Ok(decrypted) => Ok(Decrypted::Message(decrypted)),
        Err(e) if decryptor.is_active() => Err(e),
        Err(_) => Ok(Decrypted::PassedThrough(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    struct Broken {
        active: bool,
    }

    impl Decryptor for Broken {
        fn is_active(&self) -> bool {
            self.active
        }

        fn try_decrypt(&self, message: &RawdataMessage) -> Result<RawdataMessage, DecryptError> {
            Err(DecryptError::Failed {
                ulid: message.ulid,
                message: "bad padding".into(),
            })
        }
    }

    #[test]
    fn test_pass_through() {
        let msg = RawdataMessage::new(Ulid::new(), "p").with_entry("e", "x");
        let out = decrypt(&PassThroughDecryptor, msg.clone()).unwrap();
        assert!(matches!(&out, Decrypted::Message(m) if m == &msg));
    }

    #[test]
    fn test_failure_policy_depends_on_active() {
        let msg = RawdataMessage::new(Ulid::new(), "p");
        let out = decrypt(&Broken { active: false }, msg.clone()).unwrap();
        assert!(matches!(out, Decrypted::PassedThrough(_)));
        assert_eq!(out.into_message(), msg);

        assert!(matches!(
            decrypt(&Broken { active: true }, msg),
            Err(DecryptError::Failed { .. })
        ));
    }

    #[test]
    fn test_default_factory_rejects_encrypted_sources() {
        let factory = DefaultDecryptorFactory;
        let plain = factory.create("mem", &EncryptionConfig::default()).unwrap();
        assert!(!plain.is_active());

        let encrypted = EncryptionConfig {
            key: Some("k".into()),
            salt: Some("s".into()),
        };
        assert!(matches!(
            factory.create("secure", &encrypted),
            Err(DecryptError::Setup(_))
        ));
    }
}
