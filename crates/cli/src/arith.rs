//! Demo arithmetic service.

use std::time::Duration;

use corelib::{Receiver, ServiceBuilder};
use serde::{Deserialize, Serialize};

/// Operands of every `Arith` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Default)]
pub struct Arith;

impl Receiver for Arith {
    fn register(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
        builder
            .method("Multiply", |_, args: Args| async move {
                Ok::<_, String>(args.a.wrapping_mul(args.b))
            })
            .method("Sum", |_, args: Args| async move {
                Ok::<_, String>(args.a.wrapping_add(args.b))
            })
            .method("Divide", |_, args: Args| async move {
                if args.b == 0 {
                    return Err("divide by zero".to_string());
                }
                Ok(args.a / args.b)
            })
            // Sleeps `a` milliseconds, then answers `a + b`.
            .method("Sleep", |_, args: Args| async move {
                tokio::time::sleep(Duration::from_millis(args.a.max(0) as u64)).await;
                Ok::<_, String>(args.a.wrapping_add(args.b))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::{CodecType, Service};

    async fn invoke(service: &Service, method: &str, args: Args) -> Result<i64, String> {
        let codec = CodecType::Json;
        let raw = codec.encode(&args).unwrap();
        let reply = service
            .method(method)
            .unwrap()
            .prepare(codec, &raw)
            .unwrap()
            .dispatch()
            .await?;
        Ok(codec.decode(&reply).unwrap())
    }

    #[test]
    fn test_arith_methods() {
        let service = Service::new(Arith).unwrap();
        assert_eq!(service.name(), "Arith");
        let names: Vec<_> = service.methods().map(|m| m.name().to_string()).collect();
        assert_eq!(names, ["Divide", "Multiply", "Sleep", "Sum"]);
    }

    #[tokio::test]
    async fn test_arith_results() {
        let service = Service::new(Arith).unwrap();
        assert_eq!(invoke(&service, "Multiply", Args { a: 6, b: 7 }).await, Ok(42));
        assert_eq!(invoke(&service, "Sum", Args { a: 6, b: 7 }).await, Ok(13));
        assert_eq!(invoke(&service, "Divide", Args { a: 9, b: 2 }).await, Ok(4));
        assert_eq!(
            invoke(&service, "Divide", Args { a: 1, b: 0 }).await,
            Err("divide by zero".to_string())
        );
        assert_eq!(service.method("Divide").unwrap().num_calls(), 2);
    }
}
