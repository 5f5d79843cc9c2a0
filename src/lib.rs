//! # Offline First Sync
//!
//! Local-first record storage for client applications. Every collection is
//! stored durably in LMDB on the device and remains the system of record;
//! an optional sync layer replicates it to a remote service in the
//! background without ever blocking or overriding local writes. An offline
//! delivery cache keeps the application shell and static assets available
//! without network access.
//!
//! ## Layers
//!
//! - [`local_db_model::Record`] - the record contract (id, timestamps, kind)
//! - [`local_db_state`] - LMDB environment and per-collection local store
//! - [`storage::RecordStore`] - the async storage contract
//! - [`storage_factory::StorageFactory`] - builds local or synced handles
//! - [`sync_transport`] - HTTP client for the remote sync protocol
//! - [`sync_store::SyncStore`] - local-wins background replication
//! - [`offline_cache`] - install/activate/fetch offline delivery cache
//!
//! ## Quick Start
//!
//! ```no_run
//! use offline_first_sync::local_db_model::Record;
//! use offline_first_sync::local_db_state::DbEnvironment;
//! use offline_first_sync::storage_factory::StorageFactory;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), offline_first_sync::error::StoreError> {
//! let factory = StorageFactory::from_environment(DbEnvironment::open("app_data")?);
//! let habits = factory.create("habits")?;
//!
//! let saved = habits
//!     .save(Record::new().with_field("name", json!("Read 20 pages")))
//!     .await?;
//! assert!(saved.updated_at.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## FFI Functions
//!
//! C-compatible functions for Flutter and other hosts. Each returns a JSON
//! [`app_response::AppResponse`] string that must be released with
//! [`free_response`]:
//!
//! - [`create_storage`] - open the data directory
//! - [`configure_sync`] - persist a new sync configuration
//! - [`save_record`] - upsert a record
//! - [`get_by_id`] - fetch one record
//! - [`get_all`] - fetch a whole collection
//! - [`delete_by_id`] - delete one record
//! - [`clear_all_records`] - empty a collection
//! - [`close_storage`] - flush pending sync work and release the handle

pub mod app_response;
pub mod background;
pub mod error;
pub mod host_binding;
pub mod local_db_model;
pub mod local_db_state;
pub mod offline_cache;
pub mod storage;
pub mod storage_factory;
pub mod sync_config;
pub mod sync_store;
pub mod sync_transport;

#[cfg(test)]
mod test;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use log::{info, warn};

use crate::app_response::AppResponse;
use crate::host_binding::StorageBinding;
use crate::local_db_model::Record;
use crate::storage::StorageHandle;
use crate::sync_config::SyncConfig;

/// Opens the storage data directory at `path`.
///
/// The directory is created if missing. The sync configuration persisted in
/// it, if any, is loaded once and applies to every collection.
///
/// # Parameters
///
/// * `path` - A null-terminated C string with the data directory path
///
/// # Returns
///
/// A pointer to the [`StorageBinding`], or null on failure. Release it with
/// [`close_storage`].
///
/// # Safety
///
/// `path` must be null or point to a valid null-terminated string. The
/// returned pointer is owned by the caller and must be passed to
/// [`close_storage`] exactly once.
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use offline_first_sync::create_storage;
///
/// let path = CString::new("app_data").unwrap();
/// let state = create_storage(path.as_ptr());
/// assert!(!state.is_null());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_storage(path: *const c_char) -> *mut StorageBinding {
    if path.is_null() {
        warn!("Null path pointer passed to create_storage");
        return std::ptr::null_mut();
    }

    let path_str = match unsafe { CStr::from_ptr(path).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in path parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    match StorageBinding::open(path_str) {
        Ok(binding) => {
            info!("✅ Storage initialized at {path_str}");
            Box::into_raw(Box::new(binding))
        }
        Err(e) => {
            warn!("❌ Failed to initialize storage at {path_str}: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Persists a sync configuration and applies it to subsequent calls.
///
/// Handles already created are dropped, so the next call on any collection
/// runs with the new configuration.
///
/// # Parameters
///
/// * `state` - Pointer returned by [`create_storage`]
/// * `json_ptr` - A null-terminated C string with the configuration JSON
///
/// # Returns
///
/// An `Ok` response, `SerializationError` for malformed JSON, or
/// `DatabaseError` when the configuration cannot be persisted.
///
/// # Safety
///
/// `state` must be null or a live pointer from [`create_storage`], and
/// `json_ptr` null or a valid null-terminated string. The returned string
/// must be released with [`free_response`].
///
/// # JSON Format
///
/// ```json
/// { "enabled": true, "endpoint": "https://sync.example.com", "apiKey": "secret" }
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn configure_sync(state: *mut StorageBinding, json_ptr: *const c_char) -> *const c_char {
    let Some(binding) = (unsafe { state.as_ref() }) else {
        return response_to_c_string(&AppResponse::BadRequest("Null state pointer".to_string()));
    };

    let json_str = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(json) => json,
        Err(err) => return err,
    };

    let config: SyncConfig = match serde_json::from_str(&json_str) {
        Ok(config) => config,
        Err(e) => {
            let error = AppResponse::SerializationError(format!("Invalid sync configuration: {e}"));
            return response_to_c_string(&error);
        }
    };

    match binding.configure_sync(config) {
        Ok(()) => response_to_c_string(&AppResponse::success("Sync configuration saved")),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Upserts a record into `collection` and returns it as persisted.
///
/// # Parameters
///
/// * `state` - Pointer returned by [`create_storage`]
/// * `collection` - A null-terminated C string with the collection name
/// * `json_ptr` - A null-terminated C string with the record JSON
///
/// # Returns
///
/// `Ok` carrying the stored record JSON with its timestamps,
/// `ValidationError` for an empty id, `SerializationError` for malformed
/// JSON, or `BadRequest` for a null pointer or invalid collection name.
///
/// # Safety
///
/// Every pointer must be null or valid for the duration of the call; `state`
/// must come from [`create_storage`]. The returned string must be released
/// with [`free_response`].
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use offline_first_sync::{create_storage, save_record};
///
/// let path = CString::new("app_data").unwrap();
/// let state = create_storage(path.as_ptr());
/// let collection = CString::new("tasks").unwrap();
/// let json = CString::new(r#"{"id":"t1","title":"A"}"#).unwrap();
/// let result = save_record(state, collection.as_ptr(), json.as_ptr());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn save_record(
    state: *mut StorageBinding,
    collection: *const c_char,
    json_ptr: *const c_char,
) -> *const c_char {
    let json_str = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(json) => json,
        Err(err) => return err,
    };

    with_handle(state, collection, |binding, handle| {
        let record: Record = match serde_json::from_str(&json_str) {
            Ok(record) => record,
            Err(e) => return AppResponse::SerializationError(format!("Invalid JSON: {e}")),
        };

        match binding.block_on(handle.save(record)) {
            Ok(saved) => json_response(&saved),
            Err(e) => AppResponse::from(e),
        }
    })
}

/// Retrieves a record by id.
///
/// # Parameters
///
/// * `state` - Pointer returned by [`create_storage`]
/// * `collection` - A null-terminated C string with the collection name
/// * `id` - A null-terminated C string with the record id
///
/// # Returns
///
/// `Ok` carrying the record JSON, or `NotFound` when no record has that id.
///
/// # Safety
///
/// Same pointer rules as [`save_record`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_by_id(
    state: *mut StorageBinding,
    collection: *const c_char,
    id: *const c_char,
) -> *const c_char {
    let id_str = match c_ptr_to_string(id, "id") {
        Ok(id) => id,
        Err(err) => return err,
    };

    with_handle(state, collection, |binding, handle| {
        match binding.block_on(handle.get_by_id(&id_str)) {
            Ok(Some(record)) => json_response(&record),
            Ok(None) => AppResponse::NotFound(format!("No record found with id: {id_str}")),
            Err(e) => AppResponse::from(e),
        }
    })
}

/// Retrieves every record of `collection` as a JSON array.
///
/// An empty collection yields `Ok` with `[]`. When sync is enabled the
/// remote merge runs in the background and never delays this call.
///
/// # Safety
///
/// `state` must be null or a live pointer from [`create_storage`], and
/// `collection` null or a valid null-terminated string.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_all(state: *mut StorageBinding, collection: *const c_char) -> *const c_char {
    with_handle(state, collection, |binding, handle| {
        match binding.block_on(handle.get_all()) {
            Ok(records) => json_response(&records),
            Err(e) => AppResponse::from(e),
        }
    })
}

/// Deletes a record by id. Deleting an unknown id yields `NotFound`.
///
/// # Safety
///
/// Same pointer rules as [`get_by_id`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn delete_by_id(
    state: *mut StorageBinding,
    collection: *const c_char,
    id: *const c_char,
) -> *const c_char {
    let id_str = match c_ptr_to_string(id, "id") {
        Ok(id) => id,
        Err(err) => return err,
    };

    with_handle(state, collection, |binding, handle| {
        match binding.block_on(handle.delete(&id_str)) {
            Ok(true) => AppResponse::success("Record deleted successfully"),
            Ok(false) => AppResponse::NotFound(format!("No record found with id: {id_str}")),
            Err(e) => AppResponse::from(e),
        }
    })
}

/// Removes every record of `collection`. Local only; nothing is sent to
/// the remote service.
///
/// # Safety
///
/// Same pointer rules as [`get_all`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn clear_all_records(
    state: *mut StorageBinding,
    collection: *const c_char,
) -> *const c_char {
    with_handle(state, collection, |binding, handle| {
        match binding.block_on(handle.clear()) {
            Ok(()) => AppResponse::success("All records cleared successfully"),
            Err(e) => AppResponse::from(e),
        }
    })
}

/// Releases the storage state. Queued sync work gets a short grace period
/// to finish first.
///
/// # Safety
///
/// `state` must be null or a pointer from [`create_storage`] that was not
/// closed before. It must not be used after this call.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_storage(state: *mut StorageBinding) -> *const c_char {
    if state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to close_storage".to_string());
        return response_to_c_string(&error);
    }

    let binding = unsafe { Box::from_raw(state) };
    binding.close();
    response_to_c_string(&AppResponse::success("Storage closed successfully"))
}

/// Frees a string returned by any function of this library.
///
/// # Safety
///
/// `ptr` must be null or a string returned by this library that was not
/// freed before.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe { drop(CString::from_raw(ptr as *mut c_char)) };
}

/// Resolves the state pointer and collection name, then runs `op` with the
/// collection's handle.
fn with_handle<F>(state: *mut StorageBinding, collection: *const c_char, op: F) -> *const c_char
where
    F: FnOnce(&StorageBinding, StorageHandle) -> AppResponse,
{
    let Some(binding) = (unsafe { state.as_ref() }) else {
        return response_to_c_string(&AppResponse::BadRequest("Null state pointer".to_string()));
    };

    let collection = match c_ptr_to_string(collection, "collection") {
        Ok(name) => name,
        Err(err) => return err,
    };

    match binding.handle(&collection) {
        Ok(handle) => response_to_c_string(&op(binding, handle)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> AppResponse {
    match serde_json::to_string(value) {
        Ok(json) => AppResponse::Ok(json),
        Err(e) => AppResponse::SerializationError(format!("Failed to serialize result: {e}")),
    }
}

/// Serializes `response` into a C string owned by the caller.
///
/// Returns null if serialization or C string creation fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust `String`.
///
/// On a null pointer or invalid UTF-8, `Err` carries a ready-to-return
/// `BadRequest` response naming `field_name`.
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
