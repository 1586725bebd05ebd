use super::value::{NativeContext, Value};
use super::vm::Vm;

/// The one native installed at `Vm::new()`, matching the teacher's pattern
/// of populating globals from a table of `(name, function)` pairs before
/// any source is ever compiled. Returns seconds elapsed since the owning
/// `Vm` was constructed.
fn clock(ctx: NativeContext, args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("Expected 0 arguments but got {}.", args.len()));
    }
    Ok(Value::Number(ctx.elapsed_secs))
}

pub fn install_natives(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_rejects_arguments() {
        let ctx = NativeContext { elapsed_secs: 0.0 };
        assert!(clock(ctx, &[Value::Nil]).is_err());
    }

    #[test]
    fn clock_returns_elapsed_seconds() {
        let ctx = NativeContext {
            elapsed_secs: 1.5,
        };
        match clock(ctx, &[]) {
            Ok(Value::Number(n)) => assert_eq!(n, 1.5),
            other => panic!("expected Number, got {other:?}"),
        }
    }
}
