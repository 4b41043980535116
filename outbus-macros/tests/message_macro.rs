use outbus_core::StructuredMessage;
use outbus_core::registry::{Decoded, MessageRegistry};
use outbus_macros::message;

#[message(type = "order.placed", aggregate = "order", key = customer_id)]
struct OrderPlaced {
    customer_id: u64,
    amount: i64,
}

#[message(type = "order.cancelled")]
#[derive(PartialEq)]
struct OrderCancelled {
    id: String,
    reason: String,
}

#[test]
fn constants_and_accessors_are_generated() {
    assert_eq!(OrderPlaced::TYPE, "order.placed");
    assert_eq!(OrderPlaced::AGGREGATE, "order");
    assert_eq!(OrderCancelled::AGGREGATE, "");

    let placed = OrderPlaced {
        id: "o-1".into(),
        customer_id: 42,
        amount: 100,
    };
    assert_eq!(placed.id(), "o-1");
    assert_eq!(placed.partition_key(), "42");

    let cancelled = OrderCancelled {
        id: "o-2".into(),
        reason: "duplicate".into(),
    };
    assert_eq!(cancelled.partition_key(), "");
    assert_eq!(cancelled.clone(), cancelled);
}

#[test]
fn generated_id_field_serializes_first() {
    let placed = OrderPlaced {
        id: "o-1".into(),
        customer_id: 7,
        amount: 3,
    };
    let json = serde_json::to_string(&placed).unwrap();
    assert!(json.starts_with(r#"{"id":"o-1""#), "{json}");
}

#[test]
fn macro_types_round_trip_through_registry() {
    let registry = MessageRegistry::new()
        .with::<OrderPlaced>()
        .unwrap()
        .with::<OrderCancelled>()
        .unwrap();

    let msg = OrderCancelled {
        id: "o-3".into(),
        reason: "fraud".into(),
    };
    let bytes = registry.encode(&msg, Default::default()).unwrap();

    match registry.decode(&bytes).unwrap() {
        Decoded::Known(decoded) => {
            assert_eq!(decoded.type_name(), "order.cancelled");
            assert_eq!(decoded.downcast_ref::<OrderCancelled>(), Some(&msg));
            assert!(decoded.downcast_ref::<OrderPlaced>().is_none());
        }
        Decoded::Unknown { type_name, .. } => panic!("unexpected unknown type {type_name}"),
    }
}
