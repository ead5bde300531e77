//! Prism Binding Adapter
//!
//! Boundary glue between the state engine and anything that displays or
//! produces values - a DOM input, a widget, a terminal field. The adapter
//! only consumes the engine's subscribe/read/write contract; it knows nothing
//! about rendering strategy.
//!
//! - **One-way**: render the current value at a path, then re-render on every
//!   notification.
//! - **Two-way**: one-way, plus raw input pushed back through the state write
//!   path after type coercion. The notification handler compares against the
//!   target's own externally observable value first and skips the render when
//!   they already match, breaking the write -> notify -> re-render -> re-write
//!   cycle.
//!
//! Coercion failures are local to this layer: the raw string value is written
//! as-is and the engine is never corrupted.

use std::rc::Rc;

use prism_core::{StateHandle, SubscriptionHandle, Value};

/// Something a binding can render into and read back from
///
/// `current_value` must report the target's externally observable value (what
/// an input element would expose), which is what echo suppression compares
/// against.
pub trait BindingTarget {
    fn render(&self, value: &Value);
    fn current_value(&self) -> Value;
}

/// How raw input text maps into a [`Value`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coercion {
    /// Keep the raw string
    Text,
    /// Integer first, then float; fallback to the raw string
    Number,
    /// Checkbox-style truthiness; fallback to the raw string
    Boolean,
    /// Multi-valued control: an array of strings
    Multi,
}

impl Coercion {
    /// Coerce one raw input value
    pub fn apply(&self, raw: &str) -> Value {
        match self {
            Coercion::Text => Value::Str(raw.to_string()),
            Coercion::Number => {
                let trimmed = raw.trim();
                if let Ok(n) = trimmed.parse::<i64>() {
                    Value::Int(n)
                } else if let Ok(f) = trimmed.parse::<f64>() {
                    Value::Float(f)
                } else {
                    tracing::debug!(raw, "numeric coercion failed; keeping raw value");
                    Value::Str(raw.to_string())
                }
            }
            Coercion::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" | "yes" | "checked" => Value::Bool(true),
                "false" | "0" | "off" | "no" | "" => Value::Bool(false),
                _ => {
                    tracing::debug!(raw, "boolean coercion failed; keeping raw value");
                    Value::Str(raw.to_string())
                }
            },
            Coercion::Multi => Value::Array(vec![Value::Str(raw.to_string())]),
        }
    }

    /// Coerce a multi-valued selection
    pub fn apply_all(&self, raws: &[&str]) -> Value {
        match self {
            Coercion::Multi => {
                Value::Array(raws.iter().map(|r| Value::Str(r.to_string())).collect())
            }
            single => match raws {
                [only] => single.apply(only),
                _ => Value::Array(raws.iter().map(|r| single.apply(r)).collect()),
            },
        }
    }
}

/// A one-way binding: state -> target
pub struct Binding {
    sub: SubscriptionHandle,
}

impl Binding {
    /// Stop re-rendering; idempotent
    pub fn unbind(&self) {
        self.sub.dispose();
    }
}

/// Render the current value at `path` into `target` and keep it in sync
pub fn bind_one_way(state: &StateHandle, path: &str, target: Rc<dyn BindingTarget>) -> Binding {
    let initial = state.get_nested_value(path).unwrap_or(Value::Null);
    target.render(&initial);

    let sink = target.clone();
    let sub = state.subscribe(path, move |value| sink.render(value));
    Binding { sub }
}

/// A two-way binding: state -> target plus input pushed back into state
pub struct TwoWayBinding {
    state: StateHandle,
    path: String,
    coercion: Coercion,
    sub: SubscriptionHandle,
}

impl TwoWayBinding {
    /// Coerce raw input and write it through the state write path
    ///
    /// Returns whether a change was committed.
    pub fn push_input(&self, raw: &str) -> bool {
        self.state.set(&self.path, self.coercion.apply(raw))
    }

    /// Multi-valued variant of [`push_input`](TwoWayBinding::push_input)
    pub fn push_inputs(&self, raws: &[&str]) -> bool {
        self.state.set(&self.path, self.coercion.apply_all(raws))
    }

    /// Stop syncing in both directions; idempotent
    pub fn unbind(&self) {
        self.sub.dispose();
    }
}

/// Two-way binding with echo suppression on the notification side
pub fn bind_two_way(
    state: &StateHandle,
    path: &str,
    target: Rc<dyn BindingTarget>,
    coercion: Coercion,
) -> TwoWayBinding {
    let initial = state.get_nested_value(path).unwrap_or(Value::Null);
    target.render(&initial);

    let sink = target.clone();
    let sub = state.subscribe(path, move |value| {
        // skip the render when the target already shows this value
        if sink.current_value() != *value {
            sink.render(value);
        }
    });

    TwoWayBinding {
        state: state.clone(),
        path: path.to_string(),
        coercion,
        sub,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    /// Test double standing in for an input element
    struct MockInput {
        rendered: RefCell<Vec<Value>>,
        shown: RefCell<Value>,
    }

    impl MockInput {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                rendered: RefCell::new(Vec::new()),
                shown: RefCell::new(Value::Null),
            })
        }

        fn render_count(&self) -> usize {
            self.rendered.borrow().len()
        }
    }

    impl BindingTarget for MockInput {
        fn render(&self, value: &Value) {
            self.rendered.borrow_mut().push(value.clone());
            *self.shown.borrow_mut() = value.clone();
        }

        fn current_value(&self) -> Value {
            self.shown.borrow().clone()
        }
    }

    fn state(data: serde_json::Value) -> StateHandle {
        StateHandle::new(Value::from(data))
    }

    #[test]
    fn test_one_way_renders_initial_and_updates() {
        let s = state(json!({"name": "A"}));
        let input = MockInput::new();
        let binding = bind_one_way(&s, "name", input.clone());

        assert_eq!(*input.rendered.borrow(), vec![Value::Str("A".into())]);

        s.set("name", "B");
        assert_eq!(input.current_value(), Value::Str("B".into()));
        assert_eq!(input.render_count(), 2);

        binding.unbind();
        binding.unbind();
        s.set("name", "C");
        assert_eq!(input.render_count(), 2);
    }

    #[test]
    fn test_one_way_missing_path_renders_null() {
        let s = state(json!({}));
        let input = MockInput::new();
        let _binding = bind_one_way(&s, "ghost", input.clone());
        assert_eq!(*input.rendered.borrow(), vec![Value::Null]);
    }

    #[test]
    fn test_two_way_suppresses_echo_render() {
        let s = state(json!({"name": "A"}));
        let input = MockInput::new();
        let binding = bind_two_way(&s, "name", input.clone(), Coercion::Text);
        assert_eq!(input.render_count(), 1);

        // input-originated write: the target already shows "B", so the
        // notification must not re-render it
        *input.shown.borrow_mut() = Value::Str("B".into());
        assert!(binding.push_input("B"));
        assert_eq!(input.render_count(), 1);
        assert_eq!(s.get_nested_value("name"), Some(Value::Str("B".into())));

        // state-originated write still renders
        s.set("name", "C");
        assert_eq!(input.render_count(), 2);
        assert_eq!(input.current_value(), Value::Str("C".into()));
    }

    #[test]
    fn test_numeric_coercion() {
        let s = state(json!({"age": 0}));
        let input = MockInput::new();
        let binding = bind_two_way(&s, "age", input, Coercion::Number);

        binding.push_input(" 42 ");
        assert_eq!(s.get_nested_value("age"), Some(Value::Int(42)));

        binding.push_input("2.5");
        assert_eq!(s.get_nested_value("age"), Some(Value::Float(2.5)));
    }

    #[test]
    fn test_coercion_failure_falls_back_to_raw() {
        let s = state(json!({"age": 0}));
        let input = MockInput::new();
        let binding = bind_two_way(&s, "age", input, Coercion::Number);

        binding.push_input("not a number");
        assert_eq!(
            s.get_nested_value("age"),
            Some(Value::Str("not a number".into()))
        );
    }

    #[test]
    fn test_boolean_coercion() {
        assert_eq!(Coercion::Boolean.apply("on"), Value::Bool(true));
        assert_eq!(Coercion::Boolean.apply("TRUE"), Value::Bool(true));
        assert_eq!(Coercion::Boolean.apply("0"), Value::Bool(false));
        assert_eq!(Coercion::Boolean.apply(""), Value::Bool(false));
        assert_eq!(
            Coercion::Boolean.apply("maybe"),
            Value::Str("maybe".into())
        );
    }

    #[test]
    fn test_multi_coercion() {
        let s = state(json!({"tags": []}));
        let input = MockInput::new();
        let binding = bind_two_way(&s, "tags", input, Coercion::Multi);

        binding.push_inputs(&["x", "y"]);
        assert_eq!(
            s.get_nested_value("tags"),
            Some(Value::from(json!(["x", "y"])))
        );

        binding.push_input("solo");
        assert_eq!(
            s.get_nested_value("tags"),
            Some(Value::from(json!(["solo"])))
        );
    }

    #[test]
    fn test_two_way_does_not_loop_on_write_cycle() {
        // a second binding on the same path echoes state changes back into
        // renders; echo suppression keeps the pair from ping-ponging
        let s = state(json!({"v": ""}));
        let a = MockInput::new();
        let b = MockInput::new();
        let binding_a = bind_two_way(&s, "v", a.clone(), Coercion::Text);
        let _binding_b = bind_two_way(&s, "v", b.clone(), Coercion::Text);

        *a.shown.borrow_mut() = Value::Str("typed".into());
        binding_a.push_input("typed");

        // a suppressed its own echo; b rendered the new value once
        assert_eq!(a.render_count(), 1);
        assert_eq!(b.render_count(), 2);
        assert_eq!(b.current_value(), Value::Str("typed".into()));
    }
}
