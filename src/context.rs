//! Values for the typed input variables a script requests.
//!
//! Values persist for the life of the store and are written by whatever
//! supplies inputs (usually a UI). The per-type "declared" lists and the
//! active-name set are rebuilt every frame so the provider knows which
//! controls the current script actually wants.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::protocol::{
    BoolRequest, ContextInput, ContextRequest, FloatRequest, IntRequest, TextRequest,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ContextValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Text(String),
}

/// A request the script made this frame, with its declaration position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Declared<R> {
    #[serde(flatten)]
    pub request: R,
    pub sort_idx: usize,
}

#[derive(Debug, Default)]
pub struct ContextStore {
    values: HashMap<String, ContextValue>,
    floats: Vec<Declared<FloatRequest>>,
    ints: Vec<Declared<IntRequest>>,
    bools: Vec<Declared<BoolRequest>>,
    texts: Vec<Declared<TextRequest>>,
    active_names: HashSet<String>,
    next_sort_idx: usize,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: ContextValue) {
        self.values.insert(name.into(), value);
    }

    pub fn value(&self, name: &str) -> Option<&ContextValue> {
        self.values.get(name)
    }

    pub fn declared_floats(&self) -> &[Declared<FloatRequest>] {
        &self.floats
    }

    pub fn declared_ints(&self) -> &[Declared<IntRequest>] {
        &self.ints
    }

    pub fn declared_bools(&self) -> &[Declared<BoolRequest>] {
        &self.bools
    }

    pub fn declared_texts(&self) -> &[Declared<TextRequest>] {
        &self.texts
    }

    /// Names of the scalar variables the latest frame fed to the compiler.
    pub fn active_names(&self) -> &HashSet<String> {
        &self.active_names
    }

    /// Forget last frame's declarations. Stored values are kept.
    pub fn begin_frame(&mut self) {
        self.floats.clear();
        self.ints.clear();
        self.bools.clear();
        self.texts.clear();
        self.active_names.clear();
        self.next_sort_idx = 0;
    }

    /// Record a scalar request and produce the input the next evaluation reads.
    ///
    /// Image requests are not handled here and yield `None`; so do text
    /// requests, which are declared for the provider but never fed back.
    pub fn resolve(&mut self, request: &ContextRequest) -> Option<ContextInput> {
        match request {
            ContextRequest::CachedImage(_) | ContextRequest::LoadedImage(_) => None,
            ContextRequest::Float(r) => {
                let value = match self.current_or_default(&r.name, ContextValue::Float(r.def_val)) {
                    ContextValue::Float(v) => v,
                    _ => r.def_val,
                };
                let sort_idx = self.take_sort_idx();
                self.floats.push(Declared {
                    request: r.clone(),
                    sort_idx,
                });
                self.active_names.insert(r.name.clone());
                Some(ContextInput::Float {
                    name: r.name.clone(),
                    value,
                })
            }
            ContextRequest::Int(r) => {
                let value = match self.current_or_default(&r.name, ContextValue::Int(r.def_val)) {
                    ContextValue::Int(v) => v,
                    _ => r.def_val,
                };
                let sort_idx = self.take_sort_idx();
                self.ints.push(Declared {
                    request: r.clone(),
                    sort_idx,
                });
                self.active_names.insert(r.name.clone());
                Some(ContextInput::Int {
                    name: r.name.clone(),
                    value,
                })
            }
            ContextRequest::Bool(r) => {
                let value = match self.current_or_default(&r.name, ContextValue::Bool(r.def_val)) {
                    ContextValue::Bool(v) => v,
                    _ => r.def_val,
                };
                let sort_idx = self.take_sort_idx();
                self.bools.push(Declared {
                    request: r.clone(),
                    sort_idx,
                });
                self.active_names.insert(r.name.clone());
                // The compiler reads booleans as ints.
                Some(ContextInput::Int {
                    name: r.name.clone(),
                    value: i32::from(value),
                })
            }
            ContextRequest::Text(r) => {
                self.current_or_default(&r.name, ContextValue::Text(r.def_val.clone()));
                let sort_idx = self.take_sort_idx();
                self.texts.push(Declared {
                    request: r.clone(),
                    sort_idx,
                });
                None
            }
        }
    }

    fn take_sort_idx(&mut self) -> usize {
        let idx = self.next_sort_idx;
        self.next_sort_idx += 1;
        idx
    }

    /// Stored value for `name`, seeding it with `default` on first sight or
    /// when the script changed the variable's type.
    fn current_or_default(&mut self, name: &str, default: ContextValue) -> ContextValue {
        match self.values.get(name) {
            Some(v) if std::mem::discriminant(v) == std::mem::discriminant(&default) => v.clone(),
            _ => {
                self.values.insert(name.to_string(), default.clone());
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_req(name: &str, def_val: f32) -> ContextRequest {
        ContextRequest::Float(FloatRequest {
            name: name.to_string(),
            def_val,
            min_val: 0.0,
            max_val: 1.0,
        })
    }

    #[test]
    fn first_request_seeds_default_and_later_values_stick() {
        let mut store = ContextStore::new();
        store.begin_frame();
        let input = store.resolve(&float_req("gain", 0.5)).unwrap();
        assert_eq!(
            input,
            ContextInput::Float {
                name: "gain".to_string(),
                value: 0.5
            }
        );

        store.set_value("gain", ContextValue::Float(0.9));
        store.begin_frame();
        let input = store.resolve(&float_req("gain", 0.5)).unwrap();
        assert_eq!(
            input,
            ContextInput::Float {
                name: "gain".to_string(),
                value: 0.9
            }
        );
    }

    #[test]
    fn declared_lists_reset_each_frame_but_values_persist() {
        let mut store = ContextStore::new();
        store.begin_frame();
        store.resolve(&float_req("a", 1.0));
        store.resolve(&ContextRequest::Text(TextRequest {
            name: "title".to_string(),
            def_val: "hello".to_string(),
        }));
        assert_eq!(store.declared_floats().len(), 1);
        assert_eq!(store.declared_texts()[0].sort_idx, 1);
        assert!(store.active_names().contains("a"));
        assert!(!store.active_names().contains("title"));

        store.begin_frame();
        assert!(store.declared_floats().is_empty());
        assert!(store.declared_texts().is_empty());
        assert!(store.active_names().is_empty());
        assert_eq!(store.value("a"), Some(&ContextValue::Float(1.0)));
        assert_eq!(
            store.value("title"),
            Some(&ContextValue::Text("hello".to_string()))
        );
    }

    #[test]
    fn bools_are_sent_as_ints() {
        let mut store = ContextStore::new();
        store.begin_frame();
        let input = store
            .resolve(&ContextRequest::Bool(BoolRequest {
                name: "invert".to_string(),
                def_val: true,
            }))
            .unwrap();
        assert_eq!(
            input,
            ContextInput::Int {
                name: "invert".to_string(),
                value: 1
            }
        );
        assert_eq!(store.declared_bools().len(), 1);
    }

    #[test]
    fn retyped_variable_falls_back_to_new_default() {
        let mut store = ContextStore::new();
        store.set_value("n", ContextValue::Float(3.5));
        store.begin_frame();
        let input = store
            .resolve(&ContextRequest::Int(IntRequest {
                name: "n".to_string(),
                def_val: 7,
                min_val: 0,
                max_val: 10,
            }))
            .unwrap();
        assert_eq!(
            input,
            ContextInput::Int {
                name: "n".to_string(),
                value: 7
            }
        );
        assert_eq!(store.value("n"), Some(&ContextValue::Int(7)));
    }
}
