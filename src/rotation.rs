//! Display rotation notifications (spec.md §4.8, §9): an observable degrees
//! value the pipeline subscribes to, so the compositor's projection and each
//! output's next encoder `configure` pick up the current orientation.

use crate::state::Observable;

/// 0/90/180/270, matching [`crate::encoder::VideoEncoder::configure`]'s
/// rotation parameter.
pub struct RotationProvider {
    degrees: Observable<u32>,
}

impl RotationProvider {
    pub fn new(initial_degrees: u32) -> Self {
        RotationProvider { degrees: Observable::new(initial_degrees) }
    }

    pub fn degrees(&self) -> Observable<u32> {
        self.degrees.clone()
    }

    /// Called by the platform's rotation sensor/listener (external
    /// collaborator, spec.md §1). A no-op if unchanged.
    pub fn notify(&self, degrees: u32) {
        self.degrees.set(degrees);
    }
}

impl Default for RotationProvider {
    fn default() -> Self {
        RotationProvider::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_notify_does_not_fire() {
        let provider = RotationProvider::new(0);
        let mut rx = provider.degrees().subscribe();
        provider.notify(0);
        assert!(!rx.has_changed().unwrap());
        provider.notify(90);
        assert!(rx.has_changed().unwrap());
    }
}
