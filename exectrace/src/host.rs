//! Host runtime boundary
//!
//! The engine observes a managed runtime through [`HostRuntime`]: a set of
//! metadata queries and registration calls the host answers. Lifecycle and
//! call events flow the other way, through [`crate::profiler::Profiler`].
//!
//! Interface extensions are probed once at attach time into a
//! [`HostCapabilities`] value; call sites branch on its flags.

use crate::domain::{HostError, HostFunctionId, HostObjectId, HostThreadId, OsThreadId, ProfilerError};
use exectrace_common::{CodeRange, IlToNativeMapping};

/// Newest interface revision the engine knows about.
pub const MAX_INTERFACE_VERSION: u32 = 7;

/// Metadata location of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionIdentity {
    pub class_id: u64,
    pub module_id: u64,
    pub token: u32,
}

/// Method definition properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodProps {
    pub name: String,
    /// Type definition token of the declaring class, 0 for global functions.
    pub class_token: u32,
}

/// Type definition properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefProps {
    /// Simple name, possibly ending in a generic arity suffix such as `` `2 ``.
    pub name: String,
    /// Enclosing type definition token for nested classes.
    pub enclosing_class: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDomainInfo {
    pub name: String,
    pub process_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyInfo {
    pub name: String,
    pub app_domain_id: u64,
    pub module_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base_address: u64,
    pub assembly_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassInfo {
    pub module_id: u64,
    pub type_def_token: u32,
}

/// Why control crossed the managed/unmanaged boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Call,
    Return,
}

/// Outcome of a search for precompiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitCacheResult {
    Found,
    NotFound,
}

/// Queries and registrations the engine needs from the host.
///
/// Implementations must be callable from any managed thread. None of these
/// methods is ever called from the sampling signal handler.
pub trait HostRuntime: Send + Sync {
    /// Revision of the callback interface the host implements (1 or newer).
    fn interface_version(&self) -> u32;

    /// Logical thread running on the calling native thread.
    fn current_thread_id(&self) -> Result<HostThreadId, HostError>;

    /// OS thread currently running `thread`.
    ///
    /// May fail with [`HostError::UnsupportedCallSequence`] while the thread
    /// is still starting up.
    fn os_thread_id(&self, thread: HostThreadId) -> Result<OsThreadId, HostError>;

    fn event_mask(&self) -> Result<u32, HostError>;

    fn set_event_mask(&self, mask: u32) -> Result<(), HostError>;

    /// Registers the function-id mapper and the enter/leave/tailcall hooks.
    fn install_call_hooks(&self) -> Result<(), HostError>;

    fn function_identity(&self, function: HostFunctionId) -> Result<FunctionIdentity, HostError>;

    /// All native code blocks of a function. Requires interface revision 2.
    fn function_code_ranges(&self, _function: HostFunctionId) -> Result<Vec<CodeRange>, HostError> {
        Err(HostError::NotAvailable("multi-range code info"))
    }

    /// The single native code block known to revision-1 hosts.
    fn function_code_range(&self, function: HostFunctionId) -> Result<CodeRange, HostError>;

    fn il_to_native_map(&self, function: HostFunctionId) -> Result<Vec<IlToNativeMapping>, HostError>;

    fn method_props(&self, function: HostFunctionId) -> Result<MethodProps, HostError>;

    /// Properties of the type definition `token` in the metadata scope of `function`.
    fn type_def_props(&self, function: HostFunctionId, token: u32) -> Result<TypeDefProps, HostError>;

    fn app_domain_info(&self, app_domain: HostObjectId) -> Result<AppDomainInfo, HostError>;

    fn assembly_info(&self, assembly: HostObjectId) -> Result<AssemblyInfo, HostError>;

    fn module_info(&self, module: HostObjectId) -> Result<ModuleInfo, HostError>;

    fn class_info(&self, class: HostObjectId) -> Result<ClassInfo, HostError>;
}

/// Feature set negotiated with the host at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Interface revision, capped at [`MAX_INTERFACE_VERSION`].
    pub version: u32,
    /// Function-id mapping callback (every revision).
    pub function_id_map: bool,
    /// Multi-range code queries (revision 2+).
    pub code_info2: bool,
    /// Enter/leave/tailcall hooks with function-id mapping (revision 3+).
    pub enter_leave_hooks: bool,
}

impl HostCapabilities {
    /// Derives the feature set from the interface revision a host reports.
    pub fn negotiate(version: u32) -> Result<Self, ProfilerError> {
        if version == 0 {
            return Err(ProfilerError::UnsupportedInterface { version });
        }
        let version = version.min(MAX_INTERFACE_VERSION);
        Ok(Self { version, function_id_map: true, code_info2: version >= 2, enter_leave_hooks: version >= 3 })
    }

    pub fn probe(host: &dyn HostRuntime) -> Result<Self, ProfilerError> {
        Self::negotiate(host.interface_version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_rejects_version_zero() {
        assert!(matches!(
            HostCapabilities::negotiate(0),
            Err(ProfilerError::UnsupportedInterface { version: 0 })
        ));
    }

    #[test]
    fn test_negotiate_feature_flags() {
        let v1 = HostCapabilities::negotiate(1).unwrap();
        assert!(v1.function_id_map);
        assert!(!v1.code_info2);
        assert!(!v1.enter_leave_hooks);

        let v3 = HostCapabilities::negotiate(3).unwrap();
        assert!(v3.code_info2);
        assert!(v3.enter_leave_hooks);
    }

    #[test]
    fn test_negotiate_caps_future_versions() {
        let caps = HostCapabilities::negotiate(42).unwrap();
        assert_eq!(caps.version, MAX_INTERFACE_VERSION);
        assert!(caps.enter_leave_hooks);
    }
}
