// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Process-wide state as one explicit value: the root directory, the id -> instance
//! registry, and the host-registered handlers. No hidden singletons; hosts create one
//! `Runtime` and hand out `Arc<Store>` handles.

use crate::memory_file::SyncMode;
use crate::store::{Mode, Store};
use crate::{paths, ContentChangeHandler, Error, ErrorHandler, ErrorKind, RecoverStrategy, Result};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Id of the instance returned by [`Runtime::default_store`].
pub const DEFAULT_STORE_ID: &str = "pagekv.default";

//
// Handlers
//

/// Host-registered callbacks, shared by every store of one runtime.
#[derive(Default)]
pub(crate) struct Handlers {
  error: RwLock<Option<Box<ErrorHandler>>>,
  content_change: RwLock<Option<Box<ContentChangeHandler>>>,
}

impl Handlers {
  pub fn on_error(&self, id: &str, kind: ErrorKind) -> RecoverStrategy {
    self
      .error
      .read()
      .as_ref()
      .map_or(RecoverStrategy::Discard, |handler| handler(id, kind))
  }

  pub fn notify_content_changed(&self, id: &str) {
    if let Some(handler) = self.content_change.read().as_ref() {
      handler(id);
    }
  }
}

//
// OpenOptions
//

/// How to open a store: its id, process sharing mode, optional encryption key, and an
/// optional directory override.
#[derive(Clone)]
pub struct OpenOptions {
  id: String,
  mode: Mode,
  crypt_key: Option<Vec<u8>>,
  dir: Option<PathBuf>,
}

impl OpenOptions {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      mode: Mode::SingleProcess,
      crypt_key: None,
      dir: None,
    }
  }

  #[must_use]
  pub fn mode(mut self, mode: Mode) -> Self {
    self.mode = mode;
    self
  }

  /// Encrypt the store under `key` (zero-padded/truncated to 16 bytes).
  #[must_use]
  pub fn crypt_key(mut self, key: &[u8]) -> Self {
    self.crypt_key = Some(key.to_vec());
    self
  }

  /// Place the files under `dir` instead of the runtime root.
  #[must_use]
  pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
    self.dir = Some(dir.into());
    self
  }
}

//
// Runtime
//

pub struct Runtime {
  root_dir: PathBuf,
  registry: Mutex<AHashMap<String, Arc<Store>>>,
  handlers: Arc<Handlers>,
}

impl Runtime {
  /// Create a runtime rooted at `root_dir`, creating the directory if needed.
  ///
  /// # Errors
  /// Returns an error if the root directory cannot be created.
  pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
    let root_dir = root_dir.into();
    std::fs::create_dir_all(&root_dir)?;
    log::info!("root dir: {}", root_dir.display());
    Ok(Self {
      root_dir,
      registry: Mutex::new(AHashMap::new()),
      handlers: Arc::new(Handlers::default()),
    })
  }

  #[must_use]
  pub fn root_dir(&self) -> &Path {
    &self.root_dir
  }

  /// Open (or fetch the cached instance of) a store.
  ///
  /// Idempotent per instance key: a second open with the same id and directory returns
  /// the same `Arc<Store>`; its mode and key are those of the first open.
  ///
  /// # Errors
  /// Returns an error for an empty id or when the files cannot be created or mapped.
  pub fn open(&self, options: OpenOptions) -> Result<Arc<Store>> {
    if options.id.is_empty() {
      return Err(Error::EmptyId);
    }

    let instance_key = paths::instance_key(&self.root_dir, options.dir.as_deref(), &options.id);
    let mut registry = self.registry.lock();
    if let Some(store) = registry.get(&instance_key) {
      return Ok(store.clone());
    }

    let base = options.dir.as_deref().unwrap_or(&self.root_dir);
    if options.dir.is_some() {
      std::fs::create_dir_all(base)?;
    }
    if paths::has_special_character(&options.id) {
      std::fs::create_dir_all(base.join(paths::SPECIAL_CHARACTER_DIRECTORY))?;
    }

    let data_path = paths::data_path(base, &options.id);
    let meta_path = paths::meta_path(&data_path);
    log::info!(
      "opening store {} (key {instance_key}) at {}",
      options.id,
      data_path.display()
    );

    let store = Arc::new(Store::open(
      &options.id,
      instance_key.clone(),
      &data_path,
      &meta_path,
      options.mode,
      options.crypt_key.as_deref(),
      self.handlers.clone(),
    )?);
    registry.insert(instance_key, store.clone());
    Ok(store)
  }

  /// The default instance, single-process and unencrypted.
  ///
  /// # Errors
  /// Returns an error if the store cannot be opened.
  pub fn default_store(&self) -> Result<Arc<Store>> {
    self.open(OpenOptions::new(DEFAULT_STORE_ID))
  }

  /// Drop `store` from the registry. The instance dies once the last external handle
  /// goes away; a later `open` maps the files afresh.
  pub fn close(&self, store: &Store) {
    log::info!("closing store {}", store.id());
    self.registry.lock().remove(store.instance_key());
  }

  /// Sync every registered instance and drop the registry, for process shutdown.
  pub fn on_exit(&self) {
    let mut registry = self.registry.lock();
    for store in registry.values() {
      store.sync(SyncMode::Sync);
      store.clear_memory_cache();
    }
    registry.clear();
  }

  // Handler registration.

  pub fn set_error_handler(&self, handler: Box<ErrorHandler>) {
    *self.handlers.error.write() = Some(handler);
  }

  pub fn clear_error_handler(&self) {
    *self.handlers.error.write() = None;
  }

  pub fn set_content_change_handler(&self, handler: Box<ContentChangeHandler>) {
    *self.handlers.content_change.write() = Some(handler);
  }

  pub fn clear_content_change_handler(&self) {
    *self.handlers.content_change.write() = None;
  }
}

impl Drop for Runtime {
  fn drop(&mut self) {
    self.on_exit();
  }
}

#[cfg(test)]
#[path = "./runtime_test.rs"]
mod tests;
