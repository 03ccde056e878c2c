use courier_fabric::{
    codec::{BincodeCodec, Codec},
    error::Error,
    Message, Rules, Transform,
};

#[test]
fn message_encodes_into_a_large_enough_buffer() {
    let mut msg = Message::new()
        .with_address("amqp://broker/queue")
        .with_subject("greeting")
        .with_body(b"hello".to_vec());
    msg.properties_mut()
        .insert("priority".to_string(), "high".to_string());

    let mut buf = vec![0u8; 1024];
    let len = msg.encode(&mut buf).unwrap();
    let decoded = Message::decode(&buf[..len]).unwrap();

    assert_eq!(decoded, msg);
    assert_eq!(decoded.address(), Some("amqp://broker/queue"));
    assert_eq!(decoded.properties()["priority"], "high");
}

#[test]
fn message_encode_reports_overflow() {
    let msg = Message::new().with_body(vec![7u8; 256]);
    let mut buf = vec![0u8; 16];

    match msg.encode(&mut buf) {
        Err(Error::Overflow) => {}
        other => panic!("Expected Overflow error, got {:?}", other),
    }
}

#[test]
fn decode_garbage_fails() {
    let result: Result<Message, _> = BincodeCodec.decode(&[0xff; 3]);
    assert!(matches!(result, Err(Error::Codec(_))));
}

#[test]
fn first_matching_rule_wins() {
    let mut rules = Rules::new();
    rules.rule("amqp://*/special", "amqp://special-host/$1");
    rules.rule("amqp://*", "amqp://relay/$1");

    assert_eq!(
        rules.apply("amqp://a/special").unwrap().as_deref(),
        Some("amqp://special-host/a")
    );
    assert_eq!(
        rules.apply("amqp://a/b/c").unwrap().as_deref(),
        Some("amqp://relay/a/b/c")
    );
    assert_eq!(rules.apply("amqps://a").unwrap(), None);
}

#[test]
fn percent_stops_at_slash() {
    let mut rules = Rules::new();
    rules.rule("%/%", "$2.$1");

    assert_eq!(rules.apply("host/queue").unwrap().as_deref(), Some("queue.host"));
    assert_eq!(rules.apply("host/a/b").unwrap(), None);
}

#[test]
fn literal_dollar_and_missing_capture() {
    let mut rules = Rules::new();
    rules.rule("cost", "$0 and $");
    assert_eq!(rules.apply("cost").unwrap().as_deref(), Some("$0 and $"));

    let mut broken = Rules::new();
    broken.rule("*", "$3");
    match broken.apply("anything") {
        Err(Error::Custom(msg)) => assert!(msg.contains("$3")),
        other => panic!("Expected Custom error, got {:?}", other),
    }
}
