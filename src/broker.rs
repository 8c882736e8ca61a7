//! The capability broker (§4.7): the only global state in the core, scoped hierarchically as a
//! root plus one child per arena.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

type InterfaceKey = (TypeId, Option<String>);

struct InterfaceSlot {
    value: Arc<dyn Any + Send + Sync>,
    refs: u32,
}

/// A type-keyed, optionally string-discriminated LIFO stack of interface registrations.
#[derive(Default)]
struct InterfaceTable {
    stacks: HashMap<InterfaceKey, Vec<InterfaceSlot>>,
}

/// A type-keyed multicast callback table.
#[derive(Default)]
struct CallbackTable {
    handlers: HashMap<TypeId, Vec<Arc<dyn Any + Send + Sync>>>,
}

/// A type-keyed advisor set with single-use deregistration tokens.
#[derive(Default)]
struct AdvisorTable {
    sets: HashMap<TypeId, HashMap<u64, Arc<dyn Any + Send + Sync>>>,
    next_token: u64,
}

/// Scoped capability registry. The root broker has no parent; each arena gets a child broker
/// whose interface/callback/advisor lookups fall back to the parent on miss (§4.7).
pub struct Broker {
    parent: Option<Arc<Broker>>,
    interfaces: Mutex<InterfaceTable>,
    callbacks: RwLock<CallbackTable>,
    advisors: Mutex<AdvisorTable>,
}

/// Token returned by [`Broker::register_advisor`]; dropping or explicitly unregistering removes
/// the advisor exactly once.
pub struct AdvisorToken {
    broker: Weak<Broker>,
    type_id: TypeId,
    token: u64,
}

impl AdvisorToken {
    pub fn unregister(self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.advisors.lock().unwrap().sets.entry(self.type_id).or_default().remove(&self.token);
        }
    }
}

/// A live reference to a registered interface. Dropping it decrements the registration's
/// reference count, which must reach zero before `unregister` succeeds.
pub struct InterfaceRef<T> {
    broker: Weak<Broker>,
    key: InterfaceKey,
    /// The slot's original type-erased `Arc`, kept alongside `value` so `Drop` can identify
    /// which slot to decrement by pointer identity rather than by value equality.
    erased: Arc<dyn Any + Send + Sync>,
    value: Arc<T>,
}

impl<T> std::ops::Deref for InterfaceRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for InterfaceRef<T> {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            let mut table = broker.interfaces.lock().unwrap();
            if let Some(stack) = table.stacks.get_mut(&self.key) {
                for slot in stack.iter_mut() {
                    if Arc::ptr_eq(&slot.value, &self.erased) {
                        slot.refs = slot.refs.saturating_sub(1);
                        break;
                    }
                }
            }
        }
    }
}

impl Broker {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            interfaces: Mutex::new(InterfaceTable::default()),
            callbacks: RwLock::new(CallbackTable::default()),
            advisors: Mutex::new(AdvisorTable::default()),
        })
    }

    /// Creates a child broker (e.g. one per arena) whose lookups fall back to `self` on miss.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            interfaces: Mutex::new(InterfaceTable::default()),
            callbacks: RwLock::new(CallbackTable::default()),
            advisors: Mutex::new(AdvisorTable::default()),
        })
    }

    fn key_for<T: Any + Send + Sync>(name: Option<&str>) -> InterfaceKey {
        (TypeId::of::<T>(), name.map(|s| s.to_string()))
    }

    /// Registers `value` as the current implementation of interface `T` (optionally
    /// discriminated by `name`), overriding any previous registration (LIFO).
    pub fn register_interface<T: Any + Send + Sync>(self: &Arc<Self>, name: Option<&str>, value: T) {
        let key = Self::key_for::<T>(name);
        let slot = InterfaceSlot { value: Arc::new(value), refs: 0 };
        self.interfaces.lock().unwrap().stacks.entry(key).or_default().push(slot);
    }

    /// Returns the most-recently-registered implementation of `T`, falling back to the parent
    /// broker on miss.
    pub fn get_interface<T: Any + Send + Sync>(self: &Arc<Self>, name: Option<&str>) -> Option<InterfaceRef<T>> {
        let key = Self::key_for::<T>(name);
        let mut table = self.interfaces.lock().unwrap();

        if let Some(slot) = table.stacks.get_mut(&key).and_then(|s| s.last_mut()) {
            let erased = Arc::clone(&slot.value);
            if let Ok(value) = Arc::downcast::<T>(Arc::clone(&slot.value)) {
                slot.refs += 1;
                drop(table);
                return Some(InterfaceRef { broker: Arc::downgrade(self), key, erased, value });
            }
        }
        drop(table);

        self.parent.as_ref().and_then(|p| p.get_interface(name))
    }

    /// Attempts to remove the top-of-stack registration of `T`. Fails (returning the still-live
    /// reference count) if any `InterfaceRef` still holds it.
    pub fn unregister_interface<T: Any + Send + Sync>(&self, name: Option<&str>) -> Result<(), u32> {
        let key = Self::key_for::<T>(name);
        let mut table = self.interfaces.lock().unwrap();
        if let Some(stack) = table.stacks.get_mut(&key) {
            if let Some(top) = stack.last() {
                if top.refs > 0 {
                    return Err(top.refs);
                }
                stack.pop();
            }
        }
        Ok(())
    }

    /// Registers a callback for type `T`. Fire order is registration order within a scope, then
    /// the parent's handlers (§4.7, §5).
    pub fn register_callback<T: Any + Send + Sync>(&self, handler: T) {
        self.callbacks
            .write()
            .unwrap()
            .handlers
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invokes `visit` for every handler of type `T`, in registration order, then recurses into
    /// the parent broker.
    pub fn fire_callback<T: Any + Send + Sync>(&self, mut visit: impl FnMut(&T)) {
        let handlers = {
            let table = self.callbacks.read().unwrap();
            table.handlers.get(&TypeId::of::<T>()).cloned().unwrap_or_default()
        };

        for handler in &handlers {
            if let Some(h) = handler.downcast_ref::<T>() {
                visit(h);
            }
        }

        if let Some(parent) = &self.parent {
            parent.fire_callback(visit);
        }
    }

    /// Registers an advisor of type `T`; returns a single-use token that removes it.
    pub fn register_advisor<T: Any + Send + Sync>(self: &Arc<Self>, value: T) -> AdvisorToken {
        let mut table = self.advisors.lock().unwrap();
        let token = table.next_token;
        table.next_token += 1;
        table.sets.entry(TypeId::of::<T>()).or_default().insert(token, Arc::new(value));

        AdvisorToken { broker: Arc::downgrade(self), type_id: TypeId::of::<T>(), token }
    }

    /// Returns every registered advisor of type `T`, unioned with the parent's set.
    pub fn advisors<T: Any + Send + Sync + Clone>(&self) -> Vec<T> {
        let mut out: Vec<T> = {
            let table = self.advisors.lock().unwrap();
            table
                .sets
                .get(&TypeId::of::<T>())
                .map(|m| m.values().filter_map(|v| v.downcast_ref::<T>().cloned()).collect())
                .unwrap_or_default()
        };

        if let Some(parent) = &self.parent {
            out.extend(parent.advisors::<T>());
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Greeter(String);

    #[test]
    fn lifo_override_returns_most_recent_registration() {
        let root = Broker::root();
        root.register_interface::<Greeter>(None, Greeter("a".into()));
        root.register_interface::<Greeter>(None, Greeter("b".into()));

        let got = root.get_interface::<Greeter>(None).unwrap();
        assert_eq!(got.0, "b");
    }

    #[test]
    fn child_falls_back_to_parent_on_miss() {
        let root = Broker::root();
        root.register_interface::<Greeter>(None, Greeter("root".into()));
        let child = root.child();

        let got = child.get_interface::<Greeter>(None).unwrap();
        assert_eq!(got.0, "root");
    }

    #[test]
    fn unregister_fails_while_referenced() {
        let root = Broker::root();
        root.register_interface::<Greeter>(None, Greeter("x".into()));
        let held = root.get_interface::<Greeter>(None).unwrap();

        assert!(root.unregister_interface::<Greeter>(None).is_err());
        drop(held);
        assert!(root.unregister_interface::<Greeter>(None).is_ok());
    }

    #[test]
    fn callbacks_fire_in_registration_order_then_parent() {
        let root = Broker::root();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        root.register_callback::<Box<dyn Fn() + Send + Sync>>(Box::new(move || o1.lock().unwrap().push("root")));

        let child = root.child();
        let o2 = Arc::clone(&order);
        child.register_callback::<Box<dyn Fn() + Send + Sync>>(Box::new(move || o2.lock().unwrap().push("child")));

        child.fire_callback::<Box<dyn Fn() + Send + Sync>>(|f| f());

        assert_eq!(*order.lock().unwrap(), vec!["child", "root"]);
    }
}
