//! The stable ABI contract a hot-reloaded (compiled-and-`dlopen`ed)
//! module satisfies, and the `Module` adapter that wraps it.
//!
//! Rust has no stable ABI for trait objects across a `dlopen` boundary, so
//! the contract crosses that boundary as plain `extern "C"` functions
//! operating on C strings; JSON is the wire format for both call
//! arguments and results. This is the same shape real Rust plugin-loading
//! crates converge on when they need more than a fixed set of primitive
//! arguments.

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::capability::Capability;
use super::context::ModuleContext;
use super::module_trait::Module;
use super::types::CallArgs;
use crate::error::AgentError;

/// Function table a generated module exports. The loader resolves a
/// single symbol, `ellma_module_vtable`, of type
/// `unsafe extern "C" fn() -> *const ModuleVTable`, and keeps the table
/// (and the `Library` that owns it) alive for the module's lifetime.
#[repr(C)]
pub struct ModuleVTable {
    pub name: unsafe extern "C" fn() -> *const c_char,
    pub capabilities_json: unsafe extern "C" fn() -> *mut c_char,
    pub call: unsafe extern "C" fn(action: *const c_char, args_json: *const c_char) -> *mut c_char,
    /// Frees a string this module's own allocator produced. Every pointer
    /// this vtable hands back must be released through this function, not
    /// the host's allocator.
    pub free_string: unsafe extern "C" fn(ptr: *mut c_char),
}

pub type VTableFn = unsafe extern "C" fn() -> *const ModuleVTable;

/// Adapts a loaded [`ModuleVTable`] to the in-process [`Module`] trait.
/// Keeps the owning `libloading::Library` alive for as long as the module
/// is registered.
pub struct ForeignModule {
    name: String,
    vtable: &'static ModuleVTable,
    _library: Arc<libloading::Library>,
}

impl ForeignModule {
    /// # Safety
    /// `vtable` must point to a valid, `'static`-for-the-life-of-`library`
    /// `ModuleVTable` exported by `library`, satisfying the contract
    /// documented on this module.
    pub unsafe fn new(vtable: &'static ModuleVTable, library: Arc<libloading::Library>) -> Result<Self, String> {
        let raw_name = (vtable.name)();
        if raw_name.is_null() {
            return Err("module vtable returned a null name".to_string());
        }
        let name = CStr::from_ptr(raw_name).to_string_lossy().into_owned();
        Ok(Self {
            name,
            vtable,
            _library: library,
        })
    }

    fn capabilities_via_ffi(&self) -> Vec<Capability> {
        // SAFETY: `vtable` comes from a `ForeignModule` constructed
        // through `new`, which only accepts vtables satisfying the
        // documented contract.
        unsafe {
            let raw = (self.vtable.capabilities_json)();
            if raw.is_null() {
                return Vec::new();
            }
            let json = CStr::from_ptr(raw).to_string_lossy().into_owned();
            (self.vtable.free_string)(raw);
            serde_json::from_str(&json).unwrap_or_default()
        }
    }

    fn call_via_ffi(&self, action: &str, args_json: &str) -> Result<String, String> {
        let action_c = CString::new(action).map_err(|e| e.to_string())?;
        let args_c = CString::new(args_json).map_err(|e| e.to_string())?;
        // SAFETY: see `new`; both strings are valid, nul-terminated, and
        // outlive the call since they are owned locals.
        unsafe {
            let raw = (self.vtable.call)(action_c.as_ptr(), args_c.as_ptr());
            if raw.is_null() {
                return Err("module call returned a null result".to_string());
            }
            let result = CStr::from_ptr(raw).to_string_lossy().into_owned();
            (self.vtable.free_string)(raw);
            Ok(result)
        }
    }
}

#[async_trait]
impl Module for ForeignModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities_via_ffi()
    }

    async fn call(
        &self,
        action: &str,
        args: CallArgs,
        _ctx: Arc<ModuleContext>,
    ) -> Result<Value, AgentError> {
        let args_json = serde_json::to_string(&args)?;
        let action = action.to_string();
        let vtable = self.vtable as *const ModuleVTable as usize;
        let library = self._library.clone();

        let result = tokio::task::spawn_blocking(move || {
            let vtable = unsafe { &*(vtable as *const ModuleVTable) };
            let _keep_alive = library;
            let action_c = CString::new(action).map_err(|e| e.to_string())?;
            let args_c = CString::new(args_json).map_err(|e| e.to_string())?;
            unsafe {
                let raw = (vtable.call)(action_c.as_ptr(), args_c.as_ptr());
                if raw.is_null() {
                    return Err("module call returned a null result".to_string());
                }
                let result = CStr::from_ptr(raw).to_string_lossy().into_owned();
                (vtable.free_string)(raw);
                Ok(result)
            }
        })
        .await
        .map_err(|e| AgentError::ExecutionError {
            module: self.name.clone(),
            action: "call".to_string(),
            source: Box::new(AgentError::ValidationFailed(e.to_string())),
        })?
        .map_err(AgentError::ValidationFailed)?;

        Ok(serde_json::from_str(&result)?)
    }
}

// `ForeignModule`'s only non-`Send`/`Sync` field is the raw `&'static`
// reference to the vtable, which is as shareable as any other `'static`
// reference; the library handle behind it is `Arc`'d.
unsafe impl Send for ForeignModule {}
unsafe impl Sync for ForeignModule {}
