//! Per-function records and function naming
//!
//! A [`FunctionInfo`] is created on the first mapping callback or JIT event
//! for a host function id and lives until the engine is torn down. The host
//! gets a [`FunctionHandle`] for it and passes that handle back on every
//! enter/leave/tailcall, so the hot path never looks anything up.
//!
//! Names, code ranges and the IL map are filled in once, when the JIT reports
//! the function (see [`FunctionDetails::query`]).

#![allow(unsafe_code)]

use crate::domain::{EngineId, HostError, HostFunctionId};
use crate::host::{HostCapabilities, HostRuntime};
use exectrace_common::{CodeRange, IlToNativeMapping, InternalId, TraceRecord, UNKNOWN_NAME};
use log::warn;
use std::fmt::Write as _;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

/// Placeholder class name when the declaring class cannot be resolved.
pub const UNRESOLVED_CLASS_NAME: &str = "?";

/// Nesting depth after which an enclosing-class chain is treated as cyclic.
const MAX_CLASS_NESTING: usize = 64;

pub struct FunctionInfo {
    pub internal_id: InternalId,
    /// `None` for pseudo-functions such as `UNMANAGED`.
    pub host_id: Option<HostFunctionId>,
    pub owner: EngineId,
    details: OnceLock<FunctionDetails>,
}

impl FunctionInfo {
    #[must_use]
    pub fn new(internal_id: InternalId, host_id: HostFunctionId, owner: EngineId) -> Self {
        Self { internal_id, host_id: Some(host_id), owner, details: OnceLock::new() }
    }

    /// A function the host never reports, known only by name.
    #[must_use]
    pub fn pseudo(internal_id: InternalId, name: &str, owner: EngineId) -> Self {
        let details = OnceLock::new();
        let _ = details.set(FunctionDetails {
            class_name: String::new(),
            name: name.to_string(),
            code: Vec::new(),
            il_map: Vec::new(),
        });
        Self { internal_id, host_id: None, owner, details }
    }

    /// Details, once populated. Lock-free.
    pub fn details(&self) -> Option<&FunctionDetails> {
        self.details.get()
    }

    /// Populates the details unless another event already did.
    pub fn details_or_init(&self, init: impl FnOnce() -> FunctionDetails) -> &FunctionDetails {
        self.details.get_or_init(init)
    }

    /// First native code block, if known.
    pub fn first_code_range(&self) -> Option<CodeRange> {
        self.details().and_then(|details| details.code.first().copied())
    }

    /// `fun nam` record for this function.
    pub fn name_record(&self) -> TraceRecord {
        let (class_name, name) = match self.details() {
            Some(details) => (details.class_name.clone(), details.name.clone()),
            None => (String::new(), UNKNOWN_NAME.to_string()),
        };
        TraceRecord::FunctionName { function: self.internal_id, class_name, name }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionDetails {
    pub class_name: String,
    pub name: String,
    pub code: Vec<CodeRange>,
    pub il_map: Vec<IlToNativeMapping>,
}

impl FunctionDetails {
    /// Collects names, code ranges and the IL map from the host.
    ///
    /// Every query failure is logged and replaced by a placeholder; the result
    /// is always usable.
    pub fn query(host: &dyn HostRuntime, caps: HostCapabilities, function: HostFunctionId) -> Self {
        let code = if caps.code_info2 {
            host.function_code_ranges(function)
        } else {
            host.function_code_range(function).map(|range| vec![range])
        }
        .unwrap_or_else(|err| {
            warn!("Code info for {function} unavailable: {err}");
            Vec::new()
        });

        let il_map = host.il_to_native_map(function).unwrap_or_else(|err| {
            warn!("IL map for {function} unavailable: {err}");
            Vec::new()
        });

        let (class_name, name) = match host.method_props(function) {
            Ok(props) => {
                let class_name = resolve_class_name(host, function, props.class_token).unwrap_or_else(|err| {
                    warn!("Class name for {function} unavailable: {err}");
                    UNRESOLVED_CLASS_NAME.to_string()
                });
                (class_name, props.name)
            }
            Err(err) => {
                warn!("Method properties for {function} unavailable: {err}");
                (UNRESOLVED_CLASS_NAME.to_string(), UNKNOWN_NAME.to_string())
            }
        };

        Self { class_name, name, code, il_map }
    }
}

/// Fully qualified display name of a type definition.
///
/// Nested classes are joined to their enclosing classes with `.`, and each
/// level's generic arity suffix is rewritten into a parameter list:
/// ``Inner`2`` nested in ``Outer`1`` becomes `Outer<T>.Inner<T,U>`. Token 0
/// means "no class" and yields an empty name.
pub fn resolve_class_name(host: &dyn HostRuntime, function: HostFunctionId, token: u32) -> Result<String, HostError> {
    if token == 0 {
        return Ok(String::new());
    }

    let mut chain = Vec::new();
    let mut next = Some(token);
    while let Some(token) = next {
        if chain.len() == MAX_CLASS_NESTING {
            return Err(HostError::NotAvailable("acyclic enclosing class chain"));
        }
        let props = host.type_def_props(function, token)?;
        chain.push(props.name);
        next = props.enclosing_class.filter(|&enclosing| enclosing != 0);
    }

    let names: Vec<String> = chain.iter().rev().map(|name| expand_generic_arity(name)).collect();
    Ok(names.join("."))
}

/// Rewrites the last `` `N `` suffix into `<T,U,...>`.
///
/// An arity of zero (or a backtick without digits) just drops the suffix.
#[must_use]
pub fn expand_generic_arity(name: &str) -> String {
    let Some(pos) = name.rfind('`') else {
        return name.to_string();
    };

    let digits: String = name[pos + 1..].chars().take_while(char::is_ascii_digit).collect();
    let arity: u32 = digits.parse().unwrap_or(0);

    let mut out = name[..pos].to_string();
    if arity > 0 {
        out.push('<');
        for index in 0..arity {
            if index != 0 {
                out.push(',');
            }
            push_type_arg_name(&mut out, index);
        }
        out.push('>');
    }
    out
}

fn push_type_arg_name(out: &mut String, index: u32) {
    // T..Z for the first seven, then T7, T8, ...
    if index <= 6 {
        out.push(char::from(b'T' + index as u8));
    } else {
        let _ = write!(out, "T{index}");
    }
}

/// Stable reference to a [`FunctionInfo`] handed to the host.
///
/// The engine keeps every record alive until it is dropped, so a handle it
/// produced stays dereferenceable for the engine's lifetime. The handle
/// remembers the engine that produced it; an engine refuses handles from any
/// other instance.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FunctionHandle {
    ptr: NonNull<FunctionInfo>,
    engine: EngineId,
}

// SAFETY: the pointee is `Sync` (immutable fields plus a `OnceLock`) and is
// only dereferenced while the owning engine keeps it alive.
unsafe impl Send for FunctionHandle {}
// SAFETY: see `Send`.
unsafe impl Sync for FunctionHandle {}

impl FunctionHandle {
    pub(crate) fn new(info: &Arc<FunctionInfo>) -> Self {
        Self { ptr: NonNull::from(info.as_ref()), engine: info.owner }
    }

    /// Engine instance that produced the handle.
    #[must_use]
    pub fn engine(self) -> EngineId {
        self.engine
    }

    /// # Safety
    ///
    /// The engine that produced the handle must still be alive.
    pub(crate) unsafe fn info<'a>(self) -> &'a FunctionInfo {
        self.ptr.as_ref()
    }
}

impl std::fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionHandle").field("ptr", &self.ptr).field("engine", &self.engine).finish()
    }
}
