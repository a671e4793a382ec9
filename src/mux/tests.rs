use super::*;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

#[derive(Clone, Debug, PartialEq)]
enum LinkOp {
    Subscribe(String, u8),
    Unsubscribe(String),
    Publish(String, String, u8, bool),
}

#[derive(Clone, Default)]
struct MockLink {
    ops: Rc<RefCell<Vec<LinkOp>>>,
    fail_subscribe: Rc<RefCell<BTreeSet<String>>>,
}

impl MockLink {
    fn ops(&self) -> Vec<LinkOp> {
        self.ops.borrow().clone()
    }

    fn subscribe_count(&self, topic: &str) -> usize {
        self.ops
            .borrow()
            .iter()
            .filter(|op| matches!(op, LinkOp::Subscribe(t, _) if t == topic))
            .count()
    }

    fn unsubscribe_count(&self, topic: &str) -> usize {
        self.ops
            .borrow()
            .iter()
            .filter(|op| matches!(op, LinkOp::Unsubscribe(t) if t == topic))
            .count()
    }

    fn fail_next_subscribes(&self, topic: &str) {
        self.fail_subscribe.borrow_mut().insert(topic.to_string());
    }
}

impl BrokerLink for MockLink {
    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), LinkError> {
        if self.fail_subscribe.borrow().contains(topic) {
            return Err(LinkError::new("injected failure"));
        }
        self.ops
            .borrow_mut()
            .push(LinkOp::Subscribe(topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.ops
            .borrow_mut()
            .push(LinkOp::Unsubscribe(topic.to_string()));
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<(), LinkError> {
        self.ops.borrow_mut().push(LinkOp::Publish(
            topic.to_string(),
            payload.to_string(),
            qos,
            retain,
        ));
        Ok(())
    }
}

fn connected_mux() -> (TopicMultiplexer<MockLink>, MockLink) {
    let link = MockLink::default();
    let mut mux = TopicMultiplexer::new(link.clone());
    mux.link_connecting();
    mux.link_up();
    (mux, link)
}

#[test]
fn test_first_subscriber_issues_one_upstream_subscribe() {
    let (mut mux, link) = connected_mux();

    let replay = mux.subscribe("t1", 1, 0);
    assert_eq!(replay, None);
    assert_eq!(link.subscribe_count("t1"), 1);
}

#[test]
fn test_second_subscriber_skips_upstream_subscribe() {
    let (mut mux, link) = connected_mux();

    mux.subscribe("t1", 1, 0);
    mux.subscribe("t1", 2, 0);
    assert_eq!(link.subscribe_count("t1"), 1);
}

#[test]
fn test_late_joiner_gets_cached_message() {
    let (mut mux, link) = connected_mux();

    mux.subscribe("t1", 1, 0);
    mux.handle_incoming("t1", "OPEN", 0, true);

    let replay = mux.subscribe("t1", 2, 0);
    assert_eq!(
        replay,
        Some(CachedMessage {
            payload: "OPEN".to_string(),
            qos: 0,
            retain: true,
        })
    );
    // Replay does not touch the upstream
    assert_eq!(link.subscribe_count("t1"), 1);
}

#[test]
fn test_unsubscribe_counting() {
    let (mut mux, link) = connected_mux();

    mux.subscribe("t1", 1, 0);
    mux.subscribe("t1", 2, 0);

    mux.unsubscribe("t1", 1);
    assert_eq!(link.unsubscribe_count("t1"), 0);

    mux.unsubscribe("t1", 2);
    assert_eq!(link.unsubscribe_count("t1"), 1);
}

#[test]
fn test_unsubscribe_unknown_topic_is_a_no_op() {
    let (mut mux, link) = connected_mux();
    mux.unsubscribe("nope", 1);
    assert!(link.ops().is_empty());
}

#[test]
fn test_subscribe_while_disconnected_is_deferred() {
    let link = MockLink::default();
    let mut mux = TopicMultiplexer::new(link.clone());

    mux.subscribe("t1", 1, 1);
    assert_eq!(link.subscribe_count("t1"), 0);

    mux.link_connecting();
    mux.link_up();
    assert_eq!(link.subscribe_count("t1"), 1);
    assert_eq!(link.ops(), vec![LinkOp::Subscribe("t1".to_string(), 1)]);
}

#[test]
fn test_reconnect_resubscribes_live_topics_only() {
    let (mut mux, link) = connected_mux();

    mux.subscribe("t1", 1, 0);
    mux.subscribe("t2", 2, 0);
    mux.unsubscribe("t2", 2);

    mux.link_down();
    mux.link_up();

    assert_eq!(link.subscribe_count("t1"), 2);
    assert_eq!(link.subscribe_count("t2"), 1); // only the original
}

#[test]
fn test_publish_gated_on_connection() {
    let link = MockLink::default();
    let mut mux = TopicMultiplexer::new(link.clone());

    let err = mux.publish("t2", "ON", 1, false);
    assert!(matches!(err, Err(PublishError::NotConnected)));
    assert!(link.ops().is_empty());

    mux.link_connecting();
    mux.link_up();
    mux.publish("t2", "ON", 1, false).unwrap();
    assert_eq!(
        link.ops(),
        vec![LinkOp::Publish("t2".to_string(), "ON".to_string(), 1, false)]
    );
}

#[test]
fn test_fan_out_is_exact_topic_match() {
    let (mut mux, _link) = connected_mux();

    mux.subscribe("home/door", 1, 0);
    mux.subscribe("home/door", 2, 0);
    mux.subscribe("home/window", 3, 0);

    let targets = mux.handle_incoming("home/door", "OPEN", 0, false);
    assert_eq!(targets, vec![1, 2]);

    let none = mux.handle_incoming("home/+", "OPEN", 0, false);
    assert!(none.is_empty());
}

#[test]
fn test_cache_updates_on_every_message() {
    let (mut mux, _link) = connected_mux();

    mux.subscribe("t1", 1, 0);
    mux.handle_incoming("t1", "first", 0, false);
    mux.handle_incoming("t1", "second", 0, false);

    let replay = mux.subscribe("t1", 2, 0);
    assert_eq!(replay.unwrap().payload, "second");
}

#[test]
fn test_remove_subscriber_cleans_up_everywhere() {
    let (mut mux, link) = connected_mux();

    mux.subscribe("t1", 1, 0);
    mux.subscribe("t2", 1, 0);
    mux.subscribe("t2", 2, 0);

    mux.remove_subscriber(1);

    // Sole subscriber on t1: upstream unsubscribe; t2 still has subscriber 2
    assert_eq!(link.unsubscribe_count("t1"), 1);
    assert_eq!(link.unsubscribe_count("t2"), 0);
    assert_eq!(mux.handle_incoming("t2", "x", 0, false), vec![2]);
    assert!(mux.handle_incoming("t1", "x", 0, false).is_empty());
}

#[test]
fn test_failed_subscribe_marks_topic_degraded() {
    let (mut mux, link) = connected_mux();
    link.fail_next_subscribes("t1");

    mux.subscribe("t1", 1, 0);
    let degraded: Vec<&str> = mux.degraded_topics().collect();
    assert_eq!(degraded, vec!["t1"]);

    // A clean reconnect recovers the subscription
    link.fail_subscribe.borrow_mut().clear();
    mux.link_down();
    mux.link_up();
    assert_eq!(mux.degraded_topics().count(), 0);
    assert_eq!(link.subscribe_count("t1"), 1);
}

#[test]
fn test_state_transitions() {
    let link = MockLink::default();
    let mut mux = TopicMultiplexer::new(link);

    assert_eq!(mux.state(), LinkState::Disconnected);
    mux.link_connecting();
    assert_eq!(mux.state(), LinkState::Connecting);
    mux.link_up();
    assert_eq!(mux.state(), LinkState::Connected);
    mux.link_down();
    assert_eq!(mux.state(), LinkState::Disconnected);
}
