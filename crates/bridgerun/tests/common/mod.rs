//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use bridgepack::Value;
use bridgerpc::RemoteFailure;
use bridgerun::remote::LocalRemote;
use bridgerun::remote::RemoteObject;
use bridgerun::remote::RemoteResult;
use bridgerun::remote::RemoteValue;

/// A mutable remote object, constructed by `models.Counter`.
pub struct Counter {
    value: Mutex<i64>,
}

impl RemoteObject for Counter {
    fn type_name(&self) -> &str {
        "Counter"
    }

    fn module(&self) -> &str {
        "models"
    }

    fn call(&self, method: &str, args: Vec<Value>, _kwargs: BTreeMap<String, Value>) -> RemoteResult {
        match method {
            "increment" => {
                let mut value = self.value.lock().unwrap();
                *value += args.first().and_then(Value::as_i64).unwrap_or(1);
                Ok(Value::Int(*value).into())
            }
            "get" => Ok(Value::Int(*self.value.lock().unwrap()).into()),
            other => Err(RemoteFailure::new("AttributeError", format!("'Counter' object has no attribute '{}'", other))),
        }
    }
}

/// An iterable remote object whose `__iter__` yields its items.
pub struct Bag {
    items: Vec<Value>,
}

impl RemoteObject for Bag {
    fn type_name(&self) -> &str {
        "Bag"
    }

    fn module(&self) -> &str {
        "bags"
    }

    fn call(&self, method: &str, _args: Vec<Value>, _kwargs: BTreeMap<String, Value>) -> RemoteResult {
        match method {
            "__iter__" => Ok(RemoteValue::values(self.items.clone())),
            other => Err(RemoteFailure::new("AttributeError", format!("'Bag' object has no attribute '{}'", other))),
        }
    }
}

fn count_arg(args: &[Value]) -> i64 {
    args.first().and_then(Value::as_i64).unwrap_or(0)
}

/// A remote with counters, generators and a few failing functions.
pub fn remote(ttl_seconds: u64, max_size: usize) -> LocalRemote {
    LocalRemote::new(ttl_seconds, max_size)
        .class("models", "Counter", |args, _| Ok(Counter { value: Mutex::new(count_arg(&args)) }))
        .function("gen", "count", |args, _| Ok(RemoteValue::values((0..count_arg(&args)).map(Value::Int))))
        .function("gen", "broken", |args, _| {
            let good = (0..count_arg(&args)).map(|i| Ok(RemoteValue::Plain(Value::Int(i))));
            let bad = std::iter::once(Err(RemoteFailure::new("ValueError", "bad row").with_traceback("Traceback: bad row")));
            Ok(RemoteValue::iter(good.chain(bad)))
        })
        .function("gen", "rows", |_, _| {
            Ok(RemoteValue::List(vec![Value::from("a").into(), Value::from("b").into()]))
        })
        .function("bags", "make", |args, _| Ok(RemoteValue::object(Bag { items: args })))
        .function("np", "matmul", |_, _| {
            Err(RemoteFailure::new("ValueError", "shapes (3,4) and (3,4) not aligned: 4 (dim 1) != 3 (dim 0)")
                .with_traceback("Traceback (most recent call last):\n  File \"<remote>\", line 1"))
        })
        .function("torch", "forward", |_, _| {
            Err(RemoteFailure::new(
                "torch.OutOfMemoryError",
                "CUDA out of memory. Tried to allocate 2.00 GiB (GPU 0; 7.79 GiB total capacity; 512.00 MiB free)",
            ))
        })
        .function("torch", "linear", |_, _| {
            Err(RemoteFailure::new("RuntimeError", "expected scalar type Float but found Double"))
        })
        .function("lib", "lookup", |_, _| Err(RemoteFailure::new("KeyError", "'missing'")))
}

/// Polls `check` until it holds, letting spawned tasks run in between.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
