//! The advertised-MLNode-version signal (§4.5.9) comes from an external
//! upgrade-plan provider, out of scope per §1 — only this consumed contract
//! is named here, the same way `mlnet-chain-client` only names the chain's
//! contract.

pub trait VersionProvider: Send + Sync {
    /// The version every client should currently be bound to.
    fn current_version(&self) -> String;

    /// A distinct future version an upgrade plan advertises, if any. Used
    /// only for the informational liveness probe in §4.5.9.
    fn upcoming_version(&self) -> Option<String>;
}

/// A version provider that never advertises a change; useful for tests and
/// as a conservative default when no upgrade-plan provider is wired up.
pub struct StaticVersionProvider(pub String);

impl VersionProvider for StaticVersionProvider {
    fn current_version(&self) -> String {
        self.0.clone()
    }

    fn upcoming_version(&self) -> Option<String> {
        None
    }
}
