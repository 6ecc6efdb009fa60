//! Cross-module scenarios: codec through message, connection, pipeline and pool.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionInfo, ConnectionState};
use crate::error::{ErrorKind, PgError, Stage};
use crate::message::{Format, Message};
use crate::pipeline::{execute, RawResult, Rows};
use crate::pool::{Pool, PoolConfig, PoolStats};
use crate::testing::MockTransport;
use crate::types::fixtures::{Dynamic, Fixed};
use crate::types::*;

fn in_ms(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

fn pool(transport: &MockTransport, config: PoolConfig) -> Pool<MockTransport> {
    Pool::new(transport.clone(), config, TypeRegistry::default()).unwrap()
}

// ============================================================================
// Message encoding
// ============================================================================

mod message_encoding {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Composite with a single text field.
    struct Single {
        string: String,
    }

    impl HasTypeId for Single {
        fn type_name() -> Cow<'static, str> {
            Cow::Borrowed("single_field_struct")
        }

        fn register(builder: &mut RegistryBuilder) {
            builder.composite::<Self>();
        }
    }

    impl Composite for Single {
        fn describe<L: Layout<Self>>(layout: &mut L) {
            layout.field("string", |s| &s.string);
        }
    }

    impl Encode for Single {
        fn encode(&self, registry: &TypeRegistry, buf: &mut BytesMut) -> IsNull {
            encode_composite(self, registry, buf)
        }
    }

    #[test]
    fn test_scalar_pack() {
        let msg = Message::new("", (true, 42, "text"));
        assert_eq!(msg.params_count(), 3);
        assert_eq!(msg.types(), vec![Oid::BOOL, Oid::INT4, Oid::TEXT]);
        assert_eq!(msg.formats(), vec![Format::Binary; 3]);
    }

    #[test]
    fn test_empty_array_param() {
        let msg = Message::new("", (Vec::<i32>::new(),));
        assert_eq!(msg.types(), vec![Oid::INT4_ARRAY]);
        assert_eq!(
            msg.values()[0],
            Some(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 23, 0, 0, 0, 0, 0, 0, 0, 0][..])
        );
    }

    #[test]
    fn test_int_array_param() {
        let msg = Message::new("", (vec![1i32, 2],));
        assert_eq!(msg.lengths(), vec![36]);
        assert_eq!(
            msg.values()[0],
            Some(
                &[
                    0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 23, // ndim, has_null, element oid
                    0, 0, 0, 2, 0, 0, 0, 0, // count, lower bound
                    0, 0, 0, 4, 0, 0, 0, 1, // 1
                    0, 0, 0, 4, 0, 0, 0, 2, // 2
                ][..]
            )
        );
    }

    #[test]
    fn test_single_text_field_composite() {
        let value = Single {
            string: "Lorem ipsum dolor sit amet, consectetur adipiscing elit".to_string(),
        };
        let registry = TypeRegistry::builder().register::<Single>().build();
        let msg = Message::build("SELECT $1", (&value,), &registry);

        // 4 (count) + 4 (oid) + 4 (length) + 55 (text)
        assert_eq!(msg.lengths(), vec![67]);
        let bytes = msg.values()[0].unwrap();
        assert_eq!(&bytes[..4], &1i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &25u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &55i32.to_be_bytes());
        assert_eq!(&bytes[12..], value.string.as_bytes());
    }

    #[test]
    fn test_unregistered_composite_is_unknown() {
        let msg = Message::new("SELECT $1", (Fixed { value: 1 },));
        assert_eq!(msg.types(), vec![Oid::UNKNOWN]);
    }

    #[test]
    fn test_nullable_wrappers_match_contained_value() {
        let registry = TypeRegistry::default();
        let arc = Arc::new(5i64);
        let weak = Arc::downgrade(&arc);
        let msg = Message::build(
            "",
            (5i64, Some(5i64), Some(Box::new(5i64)), Some(Arc::clone(&arc)), weak),
            &registry,
        );
        let values = msg.values();
        assert!(values.iter().all(|v| *v == values[0]));
        assert!(msg.types().iter().all(|oid| *oid == Oid::INT8));

        drop(arc);
        let dangling: std::sync::Weak<i64> = std::sync::Weak::new();
        let msg = Message::build("", (dangling, Option::<Box<i64>>::None), &registry);
        assert_eq!(msg.lengths(), vec![-1, -1]);
    }
}

// ============================================================================
// Connection and pipeline
// ============================================================================

mod connection {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn open(transport: &MockTransport, registry: TypeRegistry) -> Connection<crate::testing::MockSession> {
        Connection::connect(transport, Arc::new(registry), in_ms(1000))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_rows() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.is_good());

        let rows = conn
            .request(&Message::new("SELECT", ()), in_ms(100), Rows::<(i32,)>::new())
            .await
            .unwrap();
        assert_eq!(rows, vec![(1,)]);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_result() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;

        let result = execute(&mut conn, &Message::new("SELECT", ()), in_ms(100), RawResult::new())
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.command_tag(), "SELECT 1");
        assert_eq!(result.rows_affected(), 1);
        assert_eq!(result.columns()[0].name, "session");
        assert_eq!(result.get(0, 0).unwrap(), PgValue::Int4(1));
        assert_eq!(result.try_get::<i32>(0, 0).unwrap(), 1);

        let err = result.try_get::<String>(0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_marks_bad() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;

        let err = conn
            .request(&Message::new("SELECT", ()), in_ms(100), Rows::<(String,)>::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(conn.is_bad());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_context() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;

        let err = conn
            .request(&Message::new("FAIL", ()), in_ms(100), RawResult::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryExecution);
        assert_eq!(err.code(), Some("42601"));

        let context = err.context().unwrap();
        assert!(context.starts_with("while executing \"FAIL\""));
        assert!(context.contains("syntax error"));
        assert_eq!(conn.error_context(), context);
        assert_eq!(conn.state(), ConnectionState::Bad);

        // A bad connection refuses further work.
        let err = conn
            .request(&Message::new("SELECT", ()), in_ms(100), RawResult::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
        assert_eq!(transport.log().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_marks_bad() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;

        let err = conn
            .request(&Message::new("SLEEP 500", ()), in_ms(100), RawResult::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PgError::Context { ref source, .. } if matches!(**source, PgError::Timeout(Stage::Response))
        ));
        assert!(conn.is_bad());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_never_sends() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;

        let err = conn
            .request(&Message::new("SELECT", ()), Instant::now(), RawResult::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(transport.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_poisons_connection() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            conn.request(&Message::new("SLEEP 500", ()), in_ms(1000), RawResult::new()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(conn.state(), ConnectionState::Busy);

        let err = conn
            .request(&Message::new("SELECT", ()), in_ms(100), RawResult::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
        assert!(conn.is_bad());
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_health_flag() {
        let transport = MockTransport::new();
        let conn = open(&transport, TypeRegistry::default()).await;
        assert!(conn.is_good());

        transport.break_session(conn.session().unwrap().id());
        assert!(conn.is_bad());
        assert!(!Connection::<crate::testing::MockSession>::unopened(Arc::default()).is_good());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_closes() {
        let transport = MockTransport::new().with_connect_delay(Duration::from_secs(1));
        let mut conn = Connection::unopened(Arc::new(TypeRegistry::default()));

        let err = conn.open(&transport, in_ms(100)).await.unwrap_err();
        assert!(matches!(err, PgError::Timeout(Stage::Connect)));
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Closed is terminal.
        let err = conn.open(&transport, in_ms(5000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_override() {
        let transport = MockTransport::new().with_catalog(vec![
            CatalogEntry {
                name: "dynamic_size_struct".to_string(),
                oid: Oid(100600),
                array_oid: Oid(100601),
            },
            CatalogEntry {
                name: "fixed_size_struct".to_string(),
                oid: Oid(100500),
                array_oid: Oid(100501),
            },
        ]);
        let registry = TypeRegistry::builder().composite::<Dynamic>().build();
        assert!(registry.needs_catalog());

        let conn = open(&transport, registry).await;
        let registry = conn.registry();
        assert!(!registry.needs_catalog());
        assert_eq!(registry.type_oid::<Dynamic>(), Oid(100600));
        assert_eq!(registry.type_oid::<Fixed>(), Oid(100500));
        assert_eq!(registry.type_oid::<Vec<Fixed>>(), Oid(100501));

        let value = Dynamic {
            string: "x".to_string(),
            strings: vec![],
            nested: Some(Fixed { value: 3 }),
        };
        let msg = Message::build("SELECT $1", (&value,), registry);
        assert_eq!(msg.types(), vec![Oid(100600)]);

        // The nested field is tagged with the overridden OID as well.
        let bytes = msg.values()[0].unwrap();
        let nested_oid_at = bytes.len() - 28;
        assert_eq!(&bytes[nested_oid_at..nested_oid_at + 4], &100500u32.to_be_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_missing_types_stay_unknown() {
        let transport = MockTransport::new();
        let registry = TypeRegistry::builder().composite::<Fixed>().build();

        let conn = open(&transport, registry).await;
        assert_eq!(conn.registry().type_oid::<Fixed>(), Oid::UNKNOWN);
        assert_eq!(transport.log().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_info_connects_per_request() {
        let transport = MockTransport::new();
        let info = ConnectionInfo::new(transport.clone(), TypeRegistry::default());

        for expected in 1..=3 {
            let rows = execute(&info, &Message::new("SELECT", ()), in_ms(100), Rows::<(i32,)>::new())
                .await
                .unwrap();
            assert_eq!(rows, vec![(expected,)]);
        }
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let transport = MockTransport::new();
        let mut conn = open(&transport, TypeRegistry::default()).await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.session().is_none());
        assert_eq!(transport.closes(), 1);
    }
}

// ============================================================================
// Pool
// ============================================================================

mod pool {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_capacity_one_no_queue() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(1).queue_capacity(0));

        let lease = pool.acquire(in_ms(100)).await.unwrap();
        let err = pool.acquire(in_ms(100)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert!(lease.is_good());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_one_queue_one() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(1).queue_capacity(1));

        let first = pool.acquire(in_ms(1000)).await.unwrap();
        let first_id = first.session().unwrap().id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = pool.acquire(in_ms(1000)).await?;
                Ok::<_, PgError>(lease.session().map(|s| s.id()))
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.stats().waiting, 1);

        let err = pool.acquire(in_ms(1000)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);

        drop(first);
        let second_id = waiter.await.unwrap().unwrap();
        assert_eq!(second_id, Some(first_id));
        assert_eq!(transport.connects(), 1);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_leaves_no_trace() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(1).queue_capacity(1));

        let lease = pool.acquire(in_ms(1000)).await.unwrap();
        let err = pool.acquire(in_ms(50)).await.err().unwrap();
        assert!(matches!(err, PgError::Timeout(Stage::Queue)));
        assert_eq!(pool.stats().waiting, 0);
        assert!(lease.is_good());
        assert_eq!(lease.state(), ConnectionState::Idle);

        drop(lease);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_order() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(1).queue_capacity(2));
        let order = Arc::new(Mutex::new(Vec::new()));

        let lease = pool.acquire(in_ms(1000)).await.unwrap();
        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let pool = pool.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _lease = pool.acquire(in_ms(1000)).await.unwrap();
                order.lock().push(name);
            }));
            tokio::task::yield_now().await;
        }

        drop(lease);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_connection_is_never_reused() {
        let transport = MockTransport::new();
        let pool = pool(
            &transport,
            PoolConfig::new()
                .capacity(1)
                .request_timeout(Duration::from_millis(100)),
        );

        let err = pool
            .execute(&Message::new("SLEEP 500", ()), RawResult::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(pool.stats().live, 0);

        let rows = pool
            .execute(&Message::new("SELECT", ()), Rows::<(i32,)>::new())
            .await
            .unwrap();
        assert_eq!(rows, vec![(2,)]);
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_discards_connection() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(1));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            pool.execute(&Message::new("SLEEP 500", ()), RawResult::new()),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(pool.stats(), PoolStats {
            capacity: 1,
            live: 0,
            idle: 0,
            busy: 0,
            waiting: 0,
        });

        let lease = pool.acquire(in_ms(100)).await.unwrap();
        assert_eq!(lease.session().unwrap().id(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_idle_connection_is_evicted() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(2));

        let lease = pool.acquire(in_ms(100)).await.unwrap();
        let id = lease.session().unwrap().id();
        drop(lease);
        assert_eq!(pool.stats().idle, 1);

        transport.break_session(id);
        let lease = pool.acquire(in_ms(100)).await.unwrap();
        assert_ne!(lease.session().unwrap().id(), id);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_connection_is_reused() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(4));

        for _ in 0..5 {
            let rows = pool
                .execute(&Message::new("SELECT", ()), Rows::<(i32,)>::new())
                .await
                .unwrap();
            assert_eq!(rows, vec![(1,)]);
        }
        assert_eq!(transport.connects(), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_resets_error_context() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(1));

        let mut lease = pool.acquire(in_ms(100)).await.unwrap();
        lease.set_error_context("stale");
        drop(lease);

        let lease = pool.acquire(in_ms(100)).await.unwrap();
        assert_eq!(lease.error_context(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_frees_slot() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(1).queue_capacity(0));

        transport.fail_connects(Some("connection refused"));
        let err = pool.acquire(in_ms(100)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
        assert_eq!(pool.stats().live, 0);

        transport.fail_connects(None);
        assert!(pool.acquire(in_ms(100)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_bounded_by_config() {
        let transport = MockTransport::new().with_connect_delay(Duration::from_secs(10));
        let pool = pool(
            &transport,
            PoolConfig::new().connect_timeout(Duration::from_millis(200)),
        );

        let started = Instant::now();
        let err = pool.acquire(in_ms(5000)).await.err().unwrap();
        assert!(matches!(err, PgError::Timeout(Stage::Connect)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_connections_prewarm() {
        let transport = MockTransport::new();
        let pool = Pool::connect(
            transport.clone(),
            PoolConfig::new().capacity(4).min_connections(2),
            TypeRegistry::default(),
        )
        .await
        .unwrap();

        assert_eq!(transport.connects(), 2);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_resolved_once() {
        let transport = MockTransport::new().with_catalog(vec![CatalogEntry {
            name: "fixed_size_struct".to_string(),
            oid: Oid(100500),
            array_oid: Oid(100501),
        }]);
        let registry = TypeRegistry::builder().composite::<Fixed>().build();
        let pool = Pool::new(transport.clone(), PoolConfig::new().capacity(2), registry).unwrap();

        let first = pool.acquire(in_ms(100)).await.unwrap();
        let second = pool.acquire(in_ms(100)).await.unwrap();
        assert_eq!(second.registry().type_oid::<Fixed>(), Oid(100500));
        assert_eq!(pool.registry().type_oid::<Fixed>(), Oid(100500));
        drop((first, second));

        let catalog_queries = transport
            .log()
            .iter()
            .filter(|(_, text)| text.starts_with("SELECT typname"))
            .count();
        assert_eq!(catalog_queries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_catalog_entry_looked_up_once() {
        let transport = MockTransport::new();
        let registry = TypeRegistry::builder().composite::<Fixed>().build();
        let pool = Pool::new(transport.clone(), PoolConfig::new().capacity(2), registry).unwrap();

        let first = pool.acquire(in_ms(100)).await.unwrap();
        let second = pool.acquire(in_ms(100)).await.unwrap();
        assert_eq!(second.registry().type_oid::<Fixed>(), Oid::UNKNOWN);
        assert!(!pool.registry().needs_catalog());
        drop((first, second));

        let catalog_queries = transport
            .log()
            .iter()
            .filter(|(_, text)| text.starts_with("SELECT typname"))
            .count();
        assert_eq!(catalog_queries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let transport = MockTransport::new();
        let pool = pool(&transport, PoolConfig::new().capacity(2));

        let kept = pool.acquire(in_ms(100)).await.unwrap();
        drop(pool.acquire(in_ms(100)).await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(transport.closes(), 1);

        let err = pool.acquire(in_ms(100)).await.err().unwrap();
        assert!(matches!(err, PgError::PoolClosed));

        drop(kept);
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Pool::new(MockTransport::new(), PoolConfig::new().capacity(0), TypeRegistry::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
