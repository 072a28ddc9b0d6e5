use crate::CacheStatus;

bitflags::bitflags! {
    #[derive(Default)]
    #[repr(transparent)]
    pub struct PurgeOptionsMask: u32 {
        const SOFT_PURGE = 1 << 0;
    }
}

/// Surrogate-key invalidation.
///
/// Purges are fire-and-forget: a successful return means the purge was accepted, not that every
/// matching object is already gone.
pub trait PurgeService: Send + Sync {
    fn purge_surrogate_key(
        &self,
        surrogate_key: &str,
        options: PurgeOptionsMask,
    ) -> Result<(), CacheStatus>;
}
