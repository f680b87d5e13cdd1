/// Self-check consulted by a [`crate::PatchSession`] before it starts and before it writes
/// any output. Only called when the `integrity-check` feature is enabled.
pub trait IntegrityCheck {
    fn verify_integrity(&self) -> bool;
}

/// Check that always passes
#[derive(Debug, Default, Clone, Copy)]
pub struct Trusted;

impl IntegrityCheck for Trusted {
    fn verify_integrity(&self) -> bool {
        true
    }
}

impl<F: Fn() -> bool> IntegrityCheck for F {
    fn verify_integrity(&self) -> bool {
        self()
    }
}
