//! C ABI for linking peerlink-core as a static or shared library into a foreign runtime's
//! native shim. Every value crosses as a handle (`usize`, 0 = none) or a primitive.
//!
//! Strings are passed as `(ptr, len)` UTF-8 and copied before use. Handle-returning functions
//! return 0 on failure; status functions return 0 on success and -1 on failure. The reason is
//! logged through `tracing`.

use std::os::raw::c_int;
use std::slice;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::bridge::{Bridge, BridgeError};
use crate::dispatch::{CallbackSink, ProcessEndpoint, SendMessageFn};
use crate::handle::Handle;
use crate::{config, logging};

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

/// Permanent address TTL for `peerlink_peerstore_add_addrs`.
#[no_mangle]
pub static PEERLINK_PERMANENT_ADDR_TTL: u64 = crate::peerstore::PERMANENT_ADDR_TTL;

/// Crate version as a NUL-terminated string. Static; never free it.
#[no_mangle]
pub extern "C" fn peerlink_version() -> *const u8 {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr()
}

/// Install logging, load config and start the bridge. `send_message` is called for every
/// inbound stream with `(endpoint, stream handle)` and must return 0 if it accepted the message.
/// Returns 0 on success, 1 if already initialized, -1 on failure.
#[no_mangle]
pub extern "C" fn peerlink_init(send_message: SendMessageFn) -> c_int {
    logging::init();
    if BRIDGE.get().is_some() {
        return 1;
    }
    let cfg = config::load();
    let bridge = match Bridge::new(cfg, Arc::new(CallbackSink::new(send_message))) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "peerlink_init failed");
            return -1;
        }
    };
    match BRIDGE.set(bridge) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Listen option from `count` address strings. Returns option handle or 0.
#[no_mangle]
pub extern "C" fn peerlink_listen_addr_strings(
    ptrs: *const *const u8,
    lens: *const usize,
    count: usize,
) -> usize {
    let Some(addrs) = str_list(ptrs, lens, count) else {
        return invalid("peerlink_listen_addr_strings", "bad string list");
    };
    handle_out("peerlink_listen_addr_strings", |b| b.listen_addr_strings(&addrs))
}

/// Identity option from a 32-byte ed25519 secret. Returns option handle or 0.
#[no_mangle]
pub extern "C" fn peerlink_identity_option(secret_32: *const u8) -> usize {
    if secret_32.is_null() {
        return invalid("peerlink_identity_option", "null secret");
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(unsafe { slice::from_raw_parts(secret_32, 32) });
    handle_out("peerlink_identity_option", |b| b.identity_option(secret))
}

/// Create a host from `count` option handles. Returns host handle or 0.
#[no_mangle]
pub extern "C" fn peerlink_host_new(options: *const usize, count: usize) -> usize {
    let Some(opts) = handle_list(options, count) else {
        return invalid("peerlink_host_new", "bad option handle list");
    };
    handle_out("peerlink_host_new", |b| b.host_new(&opts))
}

/// Close the host and delete its handle. Returns 0 or -1.
#[no_mangle]
pub extern "C" fn peerlink_host_close(host: usize) -> c_int {
    status_out("peerlink_host_close", |b| b.host_close(handle(host)?))
}

/// Returns a new peer-id handle for the host, or 0.
#[no_mangle]
pub extern "C" fn peerlink_host_id(host: usize) -> usize {
    handle_out("peerlink_host_id", |b| b.host_id(handle(host)?))
}

/// Returns a new address-list handle with the host's listen addresses, or 0.
#[no_mangle]
pub extern "C" fn peerlink_host_addrs(host: usize) -> usize {
    handle_out("peerlink_host_addrs", |b| b.host_addrs(handle(host)?))
}

/// Returns a new peerstore handle for the host, or 0.
#[no_mangle]
pub extern "C" fn peerlink_host_peerstore(host: usize) -> usize {
    handle_out("peerlink_host_peerstore", |b| b.host_peerstore(handle(host)?))
}

/// Send inbound streams for the protocol to `endpoint`. Returns 0 or -1.
#[no_mangle]
pub extern "C" fn peerlink_set_stream_handler(
    host: usize,
    proto_ptr: *const u8,
    proto_len: usize,
    endpoint: u64,
) -> c_int {
    let Some(proto) = str_arg(proto_ptr, proto_len) else {
        return -1;
    };
    status_out("peerlink_set_stream_handler", |b| {
        b.set_stream_handler(handle(host)?, &proto, ProcessEndpoint(endpoint))
    })
}

/// Returns 1 if a handler was removed, 0 if none was set, -1 on error.
#[no_mangle]
pub extern "C" fn peerlink_remove_stream_handler(
    host: usize,
    proto_ptr: *const u8,
    proto_len: usize,
) -> c_int {
    let Some(proto) = str_arg(proto_ptr, proto_len) else {
        return -1;
    };
    match with_bridge(|b| b.remove_stream_handler(handle(host)?, &proto)) {
        Ok(removed) => c_int::from(removed),
        Err(e) => fail("peerlink_remove_stream_handler", e, -1),
    }
}

/// Open a stream to `peer` under the protocol. Blocks until negotiated. Returns stream handle or 0.
#[no_mangle]
pub extern "C" fn peerlink_new_stream(
    host: usize,
    peer: usize,
    proto_ptr: *const u8,
    proto_len: usize,
) -> usize {
    let Some(proto) = str_arg(proto_ptr, proto_len) else {
        return 0;
    };
    handle_out("peerlink_new_stream", |b| {
        b.new_stream(handle(host)?, handle(peer)?, &proto)
    })
}

/// Merge the address list into the peer's peerstore entry. Returns 0 or -1.
#[no_mangle]
pub extern "C" fn peerlink_peerstore_add_addrs(
    peerstore: usize,
    peer: usize,
    addrs: usize,
    ttl_nanos: u64,
) -> c_int {
    status_out("peerlink_peerstore_add_addrs", |b| {
        b.peerstore_add_addrs(handle(peerstore)?, handle(peer)?, handle(addrs)?, ttl_nanos)
    })
}

/// Returns a new address-list handle with the peer's known addresses, or 0.
#[no_mangle]
pub extern "C" fn peerlink_peerstore_addrs(peerstore: usize, peer: usize) -> usize {
    handle_out("peerlink_peerstore_addrs", |b| {
        b.peerstore_addrs(handle(peerstore)?, handle(peer)?)
    })
}

/// Parse a base58 peer id. Returns peer-id handle or 0.
#[no_mangle]
pub extern "C" fn peerlink_peer_id_from_string(ptr: *const u8, len: usize) -> usize {
    let Some(s) = str_arg(ptr, len) else {
        return 0;
    };
    handle_out("peerlink_peer_id_from_string", |b| b.peer_id_from_string(&s))
}

/// Write the base58 peer id into out_buf. Returns bytes written, or -1 if out_buf is too small.
#[no_mangle]
pub extern "C" fn peerlink_peer_id_to_string(peer: usize, out_buf: *mut u8, out_len: usize) -> isize {
    if out_buf.is_null() {
        return -1;
    }
    match with_bridge(|b| b.peer_id_to_string(handle(peer)?)) {
        Ok(s) => copy_out(s.as_bytes(), out_buf, out_len),
        Err(e) => fail("peerlink_peer_id_to_string", e, -1),
    }
}

/// Parse `count` multiaddr strings into one address-list handle, or 0.
#[no_mangle]
pub extern "C" fn peerlink_addrs_from_string(
    ptrs: *const *const u8,
    lens: *const usize,
    count: usize,
) -> usize {
    let Some(addrs) = str_list(ptrs, lens, count) else {
        return invalid("peerlink_addrs_from_string", "bad string list");
    };
    handle_out("peerlink_addrs_from_string", |b| b.addrs_from_strings(&addrs))
}

/// Write the address list as newline-separated strings into out_buf. Returns bytes written or -1.
#[no_mangle]
pub extern "C" fn peerlink_addrs_to_string(addrs: usize, out_buf: *mut u8, out_len: usize) -> isize {
    if out_buf.is_null() {
        return -1;
    }
    match with_bridge(|b| b.addrs_to_strings(handle(addrs)?)) {
        Ok(list) => copy_out(list.join("\n").as_bytes(), out_buf, out_len),
        Err(e) => fail("peerlink_addrs_to_string", e, -1),
    }
}

/// One read of up to buf_len bytes. Returns bytes read (0 = end of stream) or -1.
#[no_mangle]
pub extern "C" fn peerlink_stream_read(stream: usize, buf: *mut u8, buf_len: usize) -> isize {
    if buf.is_null() && buf_len > 0 {
        return -1;
    }
    let out: &mut [u8] = if buf_len == 0 {
        &mut []
    } else {
        unsafe { slice::from_raw_parts_mut(buf, buf_len) }
    };
    match with_bridge(|b| b.stream_read(handle(stream)?, out)) {
        Ok(n) => n as isize,
        Err(e) => fail("peerlink_stream_read", e, -1),
    }
}

/// One write of len bytes. Returns bytes written or -1.
#[no_mangle]
pub extern "C" fn peerlink_stream_write(stream: usize, data: *const u8, len: usize) -> isize {
    if data.is_null() && len > 0 {
        return -1;
    }
    let data: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(data, len) }
    };
    match with_bridge(|b| b.stream_write(handle(stream)?, data)) {
        Ok(n) => n as isize,
        Err(e) => fail("peerlink_stream_write", e, -1),
    }
}

/// Close the stream and delete its handle. Returns 0 or -1.
#[no_mangle]
pub extern "C" fn peerlink_stream_close(stream: usize) -> c_int {
    status_out("peerlink_stream_close", |b| b.stream_close(handle(stream)?))
}

/// Delete a peer-id, address-list, peerstore or option handle. Returns 0 or -1.
#[no_mangle]
pub extern "C" fn peerlink_release(h: usize) -> c_int {
    status_out("peerlink_release", |b| b.release(handle(h)?))
}

#[derive(Debug, thiserror::Error)]
enum FfiError {
    #[error("peerlink_init has not been called")]
    Uninitialized,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

fn with_bridge<T>(f: impl FnOnce(&Bridge) -> Result<T, BridgeError>) -> Result<T, FfiError> {
    let bridge = BRIDGE.get().ok_or(FfiError::Uninitialized)?;
    Ok(f(bridge)?)
}

fn handle(raw: usize) -> Result<Handle, BridgeError> {
    Handle::from_raw(raw).ok_or(BridgeError::NullHandle)
}

fn handle_out(op: &str, f: impl FnOnce(&Bridge) -> Result<Handle, BridgeError>) -> usize {
    match with_bridge(f) {
        Ok(h) => h.as_raw(),
        Err(e) => fail(op, e, 0),
    }
}

fn status_out(op: &str, f: impl FnOnce(&Bridge) -> Result<(), BridgeError>) -> c_int {
    match with_bridge(f) {
        Ok(()) => 0,
        Err(e) => fail(op, e, -1),
    }
}

fn fail<T>(op: &str, e: FfiError, sentinel: T) -> T {
    tracing::error!(op, error = %e, "call failed");
    sentinel
}

fn invalid(op: &str, reason: &str) -> usize {
    tracing::error!(op, reason, "invalid argument");
    0
}

fn copy_out(bytes: &[u8], out_buf: *mut u8, out_len: usize) -> isize {
    if bytes.len() > out_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
    }
    bytes.len() as isize
}

/// Copy a `(ptr, len)` UTF-8 string. None if ptr is null or the bytes are not UTF-8.
fn str_arg(ptr: *const u8, len: usize) -> Option<String> {
    if ptr.is_null() {
        tracing::error!("null string argument");
        return None;
    }
    let bytes = unsafe { slice::from_raw_parts(ptr, len) };
    match std::str::from_utf8(bytes) {
        Ok(s) => Some(s.to_owned()),
        Err(e) => {
            tracing::error!(error = %e, "string argument is not UTF-8");
            None
        }
    }
}

fn str_list(ptrs: *const *const u8, lens: *const usize, count: usize) -> Option<Vec<String>> {
    if count == 0 {
        return Some(Vec::new());
    }
    if ptrs.is_null() || lens.is_null() {
        return None;
    }
    let ptrs = unsafe { slice::from_raw_parts(ptrs, count) };
    let lens = unsafe { slice::from_raw_parts(lens, count) };
    ptrs.iter().zip(lens).map(|(p, l)| str_arg(*p, *l)).collect()
}

fn handle_list(raw: *const usize, count: usize) -> Option<Vec<Handle>> {
    if count == 0 {
        return Some(Vec::new());
    }
    if raw.is_null() {
        return None;
    }
    unsafe { slice::from_raw_parts(raw, count) }
        .iter()
        .map(|h| Handle::from_raw(*h))
        .collect()
}
