//! Store factory and process-wide registry.
//!
//! Stores are deduplicated by canonical directory plus name: while any
//! handle to a store is alive, building the same pair again returns the
//! same instance. The registry holds weak references, so a store whose
//! handles have all been dropped is re-opened from disk on the next build.
//!
//! `build` hands the store lock to a background loader and returns only
//! once the loader holds it; every subsequent operation therefore queues
//! behind the initial parse instead of observing an empty store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};

use crate::config::Context;
use crate::kv::constants::TAG_LIMIT;
use crate::kv::encoder::{Encoder, EncoderMap, Erased, ErasedEncoder, StringSetEncoder, STRING_SET_TAG};
use crate::kv::store::{Inner, Store, WritingMode};
use crate::util::executor::{LimitExecutor, TagExecutor};
use crate::KvError;

static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<Store>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Weak<Store>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Configures and opens a [`Store`]. Create one with [`Store::builder`].
pub struct StoreBuilder {
    dir: PathBuf,
    name: String,
    mode: WritingMode,
    context: Option<Arc<Context>>,
    encoders: Vec<Arc<dyn ErasedEncoder>>,
}

impl StoreBuilder {
    pub(crate) fn new(dir: PathBuf, name: String) -> Self {
        StoreBuilder {
            dir,
            name,
            mode: WritingMode::NonBlocking,
            context: None,
            encoders: Vec::new(),
        }
    }

    /// Commit the full image synchronously on every mutation instead of
    /// mirroring through mapped files.
    pub fn blocking(mut self) -> Self {
        self.mode = WritingMode::SyncBlocking;
        self
    }

    /// Commit the full image through a coalescing background task instead
    /// of mirroring through mapped files.
    pub fn async_blocking(mut self) -> Self {
        self.mode = WritingMode::AsyncBlocking;
        self
    }

    /// Use a custom [`Context`] instead of the process default.
    pub fn context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }

    /// Register an object encoder so its records decode on open.
    pub fn encoder<E: Encoder>(mut self, encoder: E) -> Self {
        self.encoders.push(Arc::new(Erased(encoder)));
        self
    }

    pub fn build(self) -> Result<Arc<Store>, KvError> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(KvError::Argument(format!(
                "Store name '{}' is empty or contains path separators",
                self.name
            )));
        }

        let mut encoders = EncoderMap::new();
        let builtin: Arc<dyn ErasedEncoder> = Arc::new(Erased(StringSetEncoder));
        encoders.insert(STRING_SET_TAG.to_string(), builtin);
        for encoder in self.encoders {
            let tag = encoder.tag().to_string();
            if tag.is_empty() || tag.len() > TAG_LIMIT {
                return Err(KvError::Argument(format!(
                    "Encoder tag '{}' must be 1..={} characters",
                    tag, TAG_LIMIT
                )));
            }
            if encoders.insert(tag.clone(), encoder).is_some() {
                return Err(KvError::Argument(format!("Duplicate encoder tag '{}'", tag)));
            }
        }

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| KvError::Io(format!("Cannot create {}: {}", self.dir.display(), e)))?;
        let dir = self.dir.canonicalize().map_err(|e| {
            KvError::Io(format!("Cannot canonicalize {}: {}", self.dir.display(), e))
        })?;
        let registry_key = format!("{}\u{0}{}", dir.display(), self.name);

        // Builds are serialized process-wide so that one instance per
        // path+name can be guaranteed.
        let mut instances = registry().lock();
        if let Some(existing) = instances.get(&registry_key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let context = self.context.unwrap_or_else(Context::global);
        let pool = Arc::clone(context.pool());
        let store = Arc::new(Store {
            name: self.name,
            dir,
            inner: Mutex::new(Inner::new(self.mode)),
            context,
            encoders,
            apply: LimitExecutor::new(Arc::clone(&pool)),
            external_io: TagExecutor::new(pool),
            self_ref: OnceLock::new(),
        });
        let _ = store.self_ref.set(Arc::downgrade(&store));

        // Hand the store lock to the loader before publishing the
        // instance. The loader gets its own thread: it blocks on nothing
        // but the store lock and must not compete with pooled work.
        let started = Arc::new((Mutex::new(false), Condvar::new()));
        let loader = {
            let store = Arc::clone(&store);
            let started = Arc::clone(&started);
            std::thread::Builder::new()
                .name(format!("mirrorkv-load-{}", store.name))
                .spawn(move || {
                    let mut inner = store.inner.lock();
                    {
                        let (flag, cond) = &*started;
                        *flag.lock() = true;
                        cond.notify_all();
                    }
                    store.load_data(&mut inner);
                })
        };
        match loader {
            Ok(_) => {
                let (flag, cond) = &*started;
                let mut is_started = flag.lock();
                while !*is_started {
                    cond.wait(&mut is_started);
                }
            }
            Err(e) => {
                // No loader thread: parse synchronously instead.
                store.log_error(&KvError::Io(format!("Cannot spawn loader thread: {}", e)));
                let mut inner = store.inner.lock();
                store.load_data(&mut inner);
            }
        }

        instances.insert(registry_key, Arc::downgrade(&store));
        Ok(store)
    }
}
