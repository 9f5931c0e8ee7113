//! Exclusive access to the audio hardware
//!
//! Recording and playback each take a lease before touching a device; only
//! one lease exists at a time, and dropping it frees the hardware.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Which operation currently holds the audio hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOwner {
    Recording,
    Playback,
}

impl AudioOwner {
    fn as_raw(self) -> u8 {
        match self {
            AudioOwner::Recording => 1,
            AudioOwner::Playback => 2,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(AudioOwner::Recording),
            2 => Some(AudioOwner::Playback),
            _ => None,
        }
    }
}

impl fmt::Display for AudioOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioOwner::Recording => write!(f, "recording in progress"),
            AudioOwner::Playback => write!(f, "playback in progress"),
        }
    }
}

const FREE: u8 = 0;

/// Shared between one client's recording and playback controllers
#[derive(Clone, Default)]
pub struct AudioArbiter {
    holder: Arc<AtomicU8>,
}

impl AudioArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the hardware for `owner`, or report who holds it
    pub fn acquire(&self, owner: AudioOwner) -> Result<AudioLease, AudioOwner> {
        match self
            .holder
            .compare_exchange(FREE, owner.as_raw(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(AudioLease {
                holder: self.holder.clone(),
                owner,
            }),
            // A non-free value always maps to an owner
            Err(current) => Err(AudioOwner::from_raw(current).unwrap_or(owner)),
        }
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<AudioOwner> {
        AudioOwner::from_raw(self.holder.load(Ordering::Acquire))
    }
}

/// Held for the lifetime of one recording or one playback
#[derive(Debug)]
pub struct AudioLease {
    holder: Arc<AtomicU8>,
    owner: AudioOwner,
}

impl AudioLease {
    pub fn owner(&self) -> AudioOwner {
        self.owner
    }
}

impl Drop for AudioLease {
    fn drop(&mut self) {
        self.holder.store(FREE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let arbiter = AudioArbiter::new();
        let lease = arbiter.acquire(AudioOwner::Recording).unwrap();
        assert_eq!(arbiter.holder(), Some(AudioOwner::Recording));

        assert_eq!(
            arbiter.acquire(AudioOwner::Playback).unwrap_err(),
            AudioOwner::Recording
        );

        drop(lease);
        assert_eq!(arbiter.holder(), None);
        let lease = arbiter.acquire(AudioOwner::Playback).unwrap();
        assert_eq!(lease.owner(), AudioOwner::Playback);
    }
}
