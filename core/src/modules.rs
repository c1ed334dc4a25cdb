//! Module providers for `import("name")`.
//!
//! A provider is either a source blob, compiled on first import into a
//! zero-parameter module function whose single evaluation is cached by the
//! VM, or a native value (typically a map of exported names). The module
//! map is consulted at compile time; unknown names and cyclic source
//! imports are compile errors.

use ecow::EcoString;
use hashbrown::HashMap;

use crate::value::{MapData, Value};

/// One importable module.
#[derive(Debug, Clone)]
pub enum ModuleProvider {
    /// uGO source, compiled on first import. The module's value is what
    /// its top-level `return` yields.
    Source(String),
    /// A ready value exported by the host.
    Native(Value),
}

/// Name → provider mapping handed to [`crate::api::compile`].
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: HashMap<EcoString, ModuleProvider>,
}

impl ModuleMap {
    pub fn new() -> Self {
        ModuleMap::default()
    }

    pub fn add_source(&mut self, name: impl Into<EcoString>, src: impl Into<String>) -> &mut Self {
        self.modules
            .insert(name.into(), ModuleProvider::Source(src.into()));
        self
    }

    pub fn add_native(&mut self, name: impl Into<EcoString>, value: Value) -> &mut Self {
        self.modules
            .insert(name.into(), ModuleProvider::Native(value));
        self
    }

    /// Convenience: a native module from `(name, value)` export pairs.
    pub fn add_native_exports(
        &mut self,
        name: impl Into<EcoString>,
        exports: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> &mut Self {
        let mut map = MapData::new();
        for (k, v) in exports {
            map.insert(k.into(), v);
        }
        self.add_native(name, Value::map(map))
    }

    pub fn get(&self, name: &str) -> Option<&ModuleProvider> {
        self.modules.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
