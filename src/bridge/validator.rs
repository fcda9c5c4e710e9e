use super::{CommandLineBridge, WalletError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Remembers which T addresses are watch-only or invalid so each one is
/// validated by the daemon at most once.
pub struct AddressValidator {
    bridge: Arc<CommandLineBridge>,
    cache: Mutex<HashMap<String, bool>>,
    warned: AtomicBool,
}

impl AddressValidator {
    pub fn new(bridge: Arc<CommandLineBridge>) -> Self {
        Self {
            bridge,
            cache: Mutex::new(HashMap::new()),
            warned: AtomicBool::new(false),
        }
    }

    pub fn is_watch_only_or_invalid(&self, address: &str) -> Result<bool, WalletError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(known) = cache.get(address) {
            return Ok(*known);
        }
        let verdict = self.bridge.is_watch_only_or_invalid(address)?;
        cache.insert(address.to_string(), verdict);
        Ok(verdict)
    }

    /// Warns about an excluded address, only for the first one seen.
    pub fn warn_excluded(&self, address: &str) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                address = %address,
                "в кошельке есть недействительный или watch-only адрес; он скрыт и не должен использоваться для платежей"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::scripted;

    #[test]
    fn each_address_is_validated_once() {
        let (bridge, runner) = scripted(|_| r#"{"isvalid":true,"iswatchonly":false}"#.into());
        let validator = AddressValidator::new(bridge);
        for _ in 0..3 {
            assert!(!validator.is_watch_only_or_invalid("t1a").unwrap());
        }
        assert!(!validator.is_watch_only_or_invalid("t1b").unwrap());
        assert_eq!(runner.count("validateaddress"), 2);
    }

    #[test]
    fn failed_validation_is_not_cached() {
        let (bridge, runner) = scripted(|_| "error: {\"code\":-1,\"message\":\"x\"}".into());
        let validator = AddressValidator::new(bridge);
        assert!(validator.is_watch_only_or_invalid("t1a").is_err());
        assert!(validator.is_watch_only_or_invalid("t1a").is_err());
        assert_eq!(runner.count("validateaddress"), 2);
    }
}
