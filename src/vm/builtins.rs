use std::collections::HashMap;
use std::rc::Rc;

use super::value::{HostFn, Value};
use super::RuntimeError;

/// The host surface injected into the global environment before execution.
pub type Builtins = HashMap<String, HostFn>;

fn register<F>(builtins: &mut Builtins, name: &str, f: F)
where
    F: Fn(&[Value]) -> Result<Value, RuntimeError> + 'static,
{
    builtins.insert(name.to_string(), Rc::new(f));
}

fn expect_args(name: &str, args: &[Value], n: usize) -> Result<(), RuntimeError> {
    if args.len() != n {
        return Err(RuntimeError::Host(format!(
            "{name}: expected {n} args, got {}",
            args.len()
        )));
    }
    Ok(())
}

/// The default host set. Library callers may supply any other map; the VM
/// only requires that entries behave as pure-ish functions that do not touch
/// its stacks.
pub fn default_builtins() -> Builtins {
    let mut b = Builtins::new();

    register(&mut b, "max", |args| {
        expect_args("max", args, 2)?;
        Ok(Value::Number(args[0].to_number().max(args[1].to_number())))
    });
    register(&mut b, "min", |args| {
        expect_args("min", args, 2)?;
        Ok(Value::Number(args[0].to_number().min(args[1].to_number())))
    });
    register(&mut b, "abs", |args| {
        expect_args("abs", args, 1)?;
        Ok(Value::Number(args[0].to_number().abs()))
    });
    register(&mut b, "floor", |args| {
        expect_args("floor", args, 1)?;
        Ok(Value::Number(args[0].to_number().floor()))
    });
    register(&mut b, "len", |args| {
        expect_args("len", args, 1)?;
        match &args[0] {
            Value::Str(s) => Ok(Value::Number(s.len() as f64)),
            other => Err(RuntimeError::Host(format!("len requires a string, got {other}"))),
        }
    });
    register(&mut b, "str", |args| {
        expect_args("str", args, 1)?;
        Ok(Value::Str(args[0].to_string()))
    });
    register(&mut b, "num", |args| {
        expect_args("num", args, 1)?;
        Ok(Value::Number(args[0].to_number()))
    });

    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let b = default_builtins();
        b[name](args)
    }

    #[test]
    fn max_of_two_numbers() {
        assert_eq!(call("max", &[Value::Number(30.0), Value::Number(102.0)]).unwrap(), Value::Number(102.0));
    }

    #[test]
    fn min_coerces_strings() {
        assert_eq!(call("min", &[Value::Str("5".into()), Value::Number(3.0)]).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn abs_and_floor() {
        assert_eq!(call("abs", &[Value::Number(-2.5)]).unwrap(), Value::Number(2.5));
        assert_eq!(call("floor", &[Value::Number(2.9)]).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn len_of_string() {
        assert_eq!(call("len", &[Value::Str("hello".into())]).unwrap(), Value::Number(5.0));
    }

    #[test]
    fn len_rejects_non_string() {
        assert!(call("len", &[Value::Number(1.0)]).is_err());
    }

    #[test]
    fn str_uses_display_form() {
        assert_eq!(call("str", &[Value::Number(42.0)]).unwrap(), Value::Str("42".into()));
    }

    #[test]
    fn num_parses_string() {
        assert_eq!(call("num", &[Value::Str("12".into())]).unwrap(), Value::Number(12.0));
    }

    #[test]
    fn wrong_arity_is_host_error() {
        let err = call("max", &[Value::Number(1.0)]).unwrap_err();
        assert_eq!(err.to_string(), "max: expected 2 args, got 1");
    }
}
