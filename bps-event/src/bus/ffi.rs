//! FFI bindings to the native BPS event API
//!
//! The library is opened at runtime with `libloading`, so the bridge builds
//! and links on hosts that do not ship it.

use libloading::Library;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_int, c_uint, c_void, OsStr};

use super::{is_success, CompletionFn, NativeBus};
use crate::types::{BridgeError, EnvelopePtr, NativeHandle, Result};

type EventCreateFn = unsafe extern "C" fn(
    event: *mut *mut c_void,
    domain: c_uint,
    code: c_uint,
    payload_ptr: *const c_void,
    completion_function: Option<CompletionFn>,
) -> c_int;
type EventDestroyFn = unsafe extern "C" fn(event: *mut c_void);
type EventGetDomainFn = unsafe extern "C" fn(event: *mut c_void) -> c_int;
type EventGetCodeFn = unsafe extern "C" fn(event: *mut c_void) -> c_uint;
type EventGetPayloadFn = unsafe extern "C" fn(event: *mut c_void) -> *mut c_void;

/// Native bus backed by a dynamically loaded BPS library
pub struct DynamicBus {
    create: EventCreateFn,
    destroy: EventDestroyFn,
    get_domain: EventGetDomainFn,
    get_code: EventGetCodeFn,
    get_payload: EventGetPayloadFn,
    // The library copies the payload words into the event, so its payload
    // getter returns that copy. Teardown needs the block we allocated.
    envelopes: Mutex<HashMap<NativeHandle, EnvelopePtr>>,
    _library: Library,
}

impl DynamicBus {
    /// Library name used when no path is configured
    pub const DEFAULT_LIBRARY: &'static str = "libbps.so";

    /// Open the BPS library and resolve the event symbols
    pub fn load(path: impl AsRef<OsStr>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading native bus library: {:?}", path);

        // SAFETY: loading runs the library's initialisers; the BPS library has
        // no initialisers with preconditions.
        let library = unsafe { Library::new(path) }
            .map_err(|e| BridgeError::Library(format!("failed to load {:?}: {}", path, e)))?;

        // SAFETY: the declared signatures match the BPS event API.
        let bus = unsafe {
            DynamicBus {
                create: symbol(&library, b"bps_event_create\0")?,
                destroy: symbol(&library, b"bps_event_destroy\0")?,
                get_domain: symbol(&library, b"bps_event_get_domain\0")?,
                get_code: symbol(&library, b"bps_event_get_code\0")?,
                get_payload: symbol(&library, b"bps_event_get_payload\0")?,
                envelopes: Mutex::new(HashMap::new()),
                _library: library,
            }
        };

        log::info!("Native bus library loaded successfully");
        Ok(bus)
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T> {
    let sym = library.get::<T>(name).map_err(|e| {
        let printable = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned();
        BridgeError::Library(format!("missing symbol {}: {}", printable, e))
    })?;
    Ok(*sym)
}

impl NativeBus for DynamicBus {
    fn create(
        &self,
        domain: u32,
        code: u32,
        payload: EnvelopePtr,
        completion: CompletionFn,
    ) -> (i32, NativeHandle) {
        let mut raw: *mut c_void = std::ptr::null_mut();
        let status = unsafe {
            (self.create)(
                &mut raw,
                domain,
                code,
                payload.as_raw() as *const c_void,
                Some(completion),
            )
        };
        let handle = NativeHandle::from_raw(raw);
        if is_success(status) && !handle.is_null() && !payload.is_null() {
            self.envelopes.lock().insert(handle, payload);
        }
        (status, handle)
    }

    fn destroy(&self, handle: NativeHandle) {
        // The completion function runs inside this call and still needs the
        // remembered envelope.
        unsafe { (self.destroy)(handle.as_raw()) };
        self.envelopes.lock().remove(&handle);
    }

    fn domain(&self, handle: NativeHandle) -> i32 {
        unsafe { (self.get_domain)(handle.as_raw()) }
    }

    fn code(&self, handle: NativeHandle) -> u32 {
        unsafe { (self.get_code)(handle.as_raw()) }
    }

    fn payload(&self, handle: NativeHandle) -> EnvelopePtr {
        if let Some(ptr) = self.envelopes.lock().get(&handle) {
            return *ptr;
        }
        EnvelopePtr::from_raw(unsafe { (self.get_payload)(handle.as_raw()) })
    }

    fn payload_reclaimed(&self, handle: NativeHandle) {
        self.envelopes.lock().remove(&handle);
    }

    fn last_error(&self) -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }
}
