//! Notification buses

mod memory;
mod redis;

pub use memory::MemoryNotifier;
pub use redis::{RedisNotifier, RedisNotifierConfig};

use kestrel_core::Notification;

/// Channel name a notification kind travels on
pub fn channel_name<T: Notification>() -> String {
    format!("_kestrel:notification:{}", T::KIND.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{CollectNotification, WriteNotification};

    #[test]
    fn test_channel_names() {
        assert_eq!(channel_name::<CollectNotification>(), "_kestrel:notification:COLLECT");
        assert_eq!(channel_name::<WriteNotification>(), "_kestrel:notification:WRITE");
    }
}
