use crate::debugger::wire::proto::LibInfo;
use crate::{muted_error, weak_error};
use anyhow::Context;
use log::{debug, info};
use object::{Object, ObjectSymbol};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Exported symbols of a module image, addresses are relative to the image base.
#[derive(Debug, Default)]
pub struct ExportTable {
    symbols: HashMap<String, u64>,
}

impl ExportTable {
    /// Parse export table of an image file.
    ///
    /// # Arguments
    ///
    /// * `path`: path to the module image
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = fs::File::open(path).with_context(|| format!("open {path:?}"))?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        let image_base = object.relative_address_base();

        let mut symbols: HashMap<String, u64> = object
            .exports()?
            .into_iter()
            .map(|export| {
                let name = String::from_utf8_lossy(export.name()).into_owned();
                (name, export.address().wrapping_sub(image_base))
            })
            .collect();

        if symbols.is_empty() {
            symbols = object
                .dynamic_symbols()
                .filter(|sym| sym.is_definition())
                .filter_map(|sym| Some((sym.name().ok()?.to_string(), sym.address())))
                .collect();
        }

        debug!(target: "registry", "{} exports found in {path:?}", symbols.len());
        Ok(Self { symbols })
    }

    /// Return symbol address relative to the image base.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

enum ExportState {
    Unopened,
    Open(ExportTable),
    Unavailable,
    /// Module is unloaded or the session is over, lookups always miss.
    Closed,
}

/// Shared library loaded into the target process.
pub struct Module {
    /// Lower-cased path, module identity together with base address.
    path: String,
    /// Lower-cased file name, key of the name index.
    name: String,
    image: PathBuf,
    base: u64,
    size: u64,
    exports: Mutex<ExportState>,
}

impl Module {
    /// Create module description, export table is opened on first symbol lookup.
    ///
    /// # Arguments
    ///
    /// * `path`: image path as reported by the debug server
    /// * `base`: load address
    pub fn new(path: &str, base: u64) -> Self {
        let image = PathBuf::from(path);
        let size = muted_error!(fs::metadata(&image), "module image size:")
            .map(|meta| meta.len())
            .unwrap_or_default();
        Self {
            path: path.to_lowercase(),
            name: simple_name(path).to_lowercase(),
            image,
            base,
            size,
            exports: Mutex::new(ExportState::Unopened),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Image size in bytes, zero if the image file is not accessible.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// True if the export table is parsed and held in memory.
    pub fn is_open(&self) -> bool {
        let exports = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(*exports, ExportState::Open(_))
    }

    /// Find exported symbol, return its address in the target process.
    pub fn lookup(&self, symbol: &str) -> Option<u64> {
        let mut exports = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        if let ExportState::Unopened = *exports {
            *exports = match weak_error!(ExportTable::open(&self.image), "module export table:") {
                Some(table) => ExportState::Open(table),
                None => ExportState::Unavailable,
            };
        }
        match &*exports {
            ExportState::Open(table) => table.get(symbol).map(|rva| self.base + rva),
            _ => None,
        }
    }

    /// Release export table. A closed module is never reopened.
    pub fn close(&self) {
        let mut exports = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        *exports = ExportState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        let exports = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(*exports, ExportState::Closed)
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}

fn simple_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Loaded modules of the target process.
#[derive(Default)]
pub struct ModuleRegistry {
    /// `None` until the first resolution.
    modules: Option<Vec<Arc<Module>>>,
    by_name: HashMap<String, Arc<Module>>,
    stale: bool,
}

impl ModuleRegistry {
    pub fn is_resolved(&self) -> bool {
        self.modules.is_some()
    }

    /// Request re-resolution on next access.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn needs_resolution(&self) -> bool {
        self.modules.is_none() || self.stale
    }

    /// Replace module list with a fresh server report.
    /// Modules with unchanged path and base address are kept as is (export tables
    /// are not reopened), vanished modules are closed.
    ///
    /// # Arguments
    ///
    /// * `libs`: current `libinfo` report
    pub fn resolve(&mut self, libs: Vec<LibInfo>) {
        let old = self.modules.take().unwrap_or_default();
        let old_by_path: HashMap<&str, &Arc<Module>> =
            old.iter().map(|m| (m.path(), m)).collect();

        let mut kept = 0;
        let modules: Vec<Arc<Module>> = libs
            .into_iter()
            .map(|lib| match old_by_path.get(lib.path.to_lowercase().as_str()) {
                Some(module) if module.base() == lib.base => {
                    kept += 1;
                    Arc::clone(module)
                }
                _ => {
                    debug!(target: "registry", "module {} loaded at {:#x}", lib.path, lib.base);
                    Arc::new(Module::new(&lib.path, lib.base))
                }
            })
            .collect();

        for module in old.iter() {
            if !modules.iter().any(|m| Arc::ptr_eq(m, module)) {
                debug!(target: "registry", "module {} unloaded", module.path());
                module.close();
            }
        }

        self.by_name = modules
            .iter()
            .map(|m| (m.name().to_string(), Arc::clone(m)))
            .collect();
        info!(
            target: "registry",
            "{} modules resolved, {kept} kept from previous resolution",
            modules.len()
        );
        self.modules = Some(modules);
        self.stale = false;
    }

    /// Currently known modules, empty if not resolved yet.
    pub fn modules(&self) -> &[Arc<Module>] {
        self.modules.as_deref().unwrap_or_default()
    }

    /// Find module by file name, case insensitive.
    pub fn find(&self, name: &str) -> Option<Arc<Module>> {
        self.by_name.get(&name.to_lowercase()).cloned()
    }

    /// Find module which image contains `addr`.
    pub fn find_by_addr(&self, addr: u64) -> Option<Arc<Module>> {
        self.modules().iter().find(|m| m.contains(addr)).cloned()
    }

    /// Return address of `symbol` exported by `module`.
    /// Unknown module is not an error, just a miss.
    pub fn lookup_symbol(&self, module: &str, symbol: &str) -> Option<u64> {
        self.find(module)?.lookup(symbol)
    }

    /// Close all modules and forget them.
    pub fn close_all(&mut self) {
        self.modules().iter().for_each(|m| m.close());
        self.modules = None;
        self.by_name.clear();
        self.stale = false;
    }
}
