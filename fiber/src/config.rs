//! Process-global configuration interface.
//!
//! The runtime consumes configuration through exactly two operations: a
//! typed lookup with a default, and change-notification listeners on the
//! returned variable. Where the values come from (files, environment, an
//! admin endpoint) is the embedding application's business — it feeds the
//! store through [`set_str`].

use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A typed configuration variable with change listeners.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Clone + Send + Sync + 'static> ConfigVar<T> {
    fn new(name: &str, default: T, description: &str) -> ConfigVar<T> {
        ConfigVar {
            name: name.to_owned(),
            description: description.to_owned(),
            value: RwLock::new(default),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn description(&self) -> &str { &self.description }

    pub fn get(&self) -> T { self.value.read().expect("config lock").clone() }

    /// Replaces the value and notifies listeners with the old and new
    /// values.
    pub fn set(&self, value: T) {
        let old = {
            let mut slot = self.value.write().expect("config lock");
            std::mem::replace(&mut *slot, value.clone())
        };
        for listener in self.listeners.lock().expect("config lock").iter() {
            listener(&old, &value);
        }
    }

    /// Registers a change listener called as `listener(old, new)`.
    pub fn add_listener(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) {
        self.listeners.lock().expect("config lock").push(Box::new(listener));
    }
}

type Setter = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct Registry {
    vars: HashMap<String, Arc<dyn Any + Send + Sync>>,
    setters: HashMap<String, Setter>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

/// Returns the variable registered under `name`, creating it with `default`
/// on first lookup. Looking the same key up under two different types is a
/// programming error.
pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
where T: FromStr + Clone + Send + Sync + 'static {
    let mut registry = registry().lock().expect("config lock");
    if let Some(var) = registry.vars.get(name) {
        return var
            .clone()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| panic!("config key {name} redeclared under a different type"));
    }
    let var = Arc::new(ConfigVar::new(name, default, description));
    registry.vars.insert(name.to_owned(), var.clone());
    let setter_var = var.clone();
    registry.setters.insert(
        name.to_owned(),
        Box::new(move |raw| match raw.parse::<T>() {
            Ok(value) => {
                setter_var.set(value);
                true
            }
            Err(_) => false,
        }),
    );
    var
}

/// Parses `value` into the variable registered under `name`. Returns false
/// for unknown keys and unparsable values.
pub fn set_str(name: &str, value: &str) -> bool {
    let registry = registry().lock().expect("config lock");
    match registry.setters.get(name) {
        Some(setter) => setter(value),
        None => {
            log::warn!(target: "fiber", "set of unknown config key {name}");
            false
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn lookup_set_and_listen() {
        let var = lookup::<u32>("test.value", 7, "test value");
        assert_eq!(var.get(), 7);

        let observed = Arc::new(AtomicU32::new(0));
        let o = observed.clone();
        var.add_listener(move |&old, &new| {
            assert_eq!(old, 7);
            o.store(new, Ordering::SeqCst);
        });

        assert!(set_str("test.value", "42"));
        assert_eq!(var.get(), 42);
        assert_eq!(observed.load(Ordering::SeqCst), 42);

        assert!(!set_str("test.value", "not a number"));
        assert!(!set_str("test.unknown", "1"));
    }
}
