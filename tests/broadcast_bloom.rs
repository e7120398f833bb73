use anyhow::Result;
use membus::{
    BloomFilter, BusCreateRequest, DeliveredMessage, Domain, HelloRequest, Item, MatchItem,
    MatchRule, Message, RecvCmd, Role,
};

fn process_uid() -> u32 {
    unsafe { libc::getuid() }
}

fn setup(stem: &str) -> Result<(std::sync::Arc<membus::Domain>, std::sync::Arc<membus::Bus>)> {
    let domain = Domain::new();
    let bus = domain.create_bus(BusCreateRequest {
        name: format!("{}-{}", process_uid(), stem),
        ..Default::default()
    })?;
    Ok((domain, bus))
}

fn broadcast(filter: BloomFilter, cookie: u64) -> Message {
    Message {
        dst_id: Some(membus::item::BROADCAST_ID),
        cookie,
        bloom: Some(filter),
        items: vec![Item::PayloadVec(b"signal".to_vec())],
        ..Default::default()
    }
}

fn drain_cookies(conn: &membus::Connection) -> Vec<u64> {
    let mut cookies = Vec::new();
    while let Ok(got) = conn.recv(RecvCmd::default()) {
        let record = DeliveredMessage::from_bytes(&conn.read_slice(got.offset).unwrap()).unwrap();
        cookies.push(record.cookie);
        conn.free_slice(got.offset).unwrap();
    }
    cookies
}

/// Scenario: bloom-filtered broadcast. A mask-subscribed receiver sees
/// exactly the matching broadcasts; a monitor sees everything.
#[test]
fn broadcast_with_bloom_and_monitor() -> Result<()> {
    let (_domain, bus) = setup("bloom")?;
    let params = bus.bloom_params();
    let ep = bus.default_endpoint();
    let (sender, _) = ep.hello(HelloRequest::default())?;
    let (subscriber, _) = ep.hello(HelloRequest::default())?;
    let (monitor, _) = ep.hello(HelloRequest {
        role: Role::Monitor,
        ..Default::default()
    })?;

    let mask = BloomFilter::from_keys(&params, &["org.example.Interesting"]);
    subscriber.match_add(MatchRule {
        cookie: 1,
        items: vec![MatchItem::BloomMask(mask.0.clone())],
    })?;

    let matching = BloomFilter::from_keys(&params, &["org.example.Interesting", "extra.key"]);
    let other = BloomFilter::from_keys(&params, &["org.example.Boring"]);
    sender.send(broadcast(matching, 1))?;
    sender.send(broadcast(other, 2))?;

    assert_eq!(drain_cookies(&subscriber), vec![1]);
    assert_eq!(drain_cookies(&monitor), vec![1, 2]);
    Ok(())
}

/// A receiver without any match rule sees no broadcasts at all.
#[test]
fn unsubscribed_receivers_are_skipped() -> Result<()> {
    let (_domain, bus) = setup("nosub")?;
    let params = bus.bloom_params();
    let ep = bus.default_endpoint();
    let (sender, _) = ep.hello(HelloRequest::default())?;
    let (bystander, _) = ep.hello(HelloRequest::default())?;

    sender.send(broadcast(BloomFilter::from_keys(&params, &["a.b"]), 9))?;
    assert_eq!(bystander.queue_len(), 0);
    Ok(())
}

/// Sender-scoped rules: a subscription keyed to a sender id only fires
/// for that sender, and stays deterministic when unrelated rules arrive.
#[test]
fn sender_scoped_subscription() -> Result<()> {
    let (_domain, bus) = setup("senderscope")?;
    let params = bus.bloom_params();
    let ep = bus.default_endpoint();
    let (wanted, _) = ep.hello(HelloRequest::default())?;
    let (unwanted, _) = ep.hello(HelloRequest::default())?;
    let (subscriber, _) = ep.hello(HelloRequest::default())?;

    let mask = BloomFilter::from_keys(&params, &["k.e.y"]);
    subscriber.match_add(MatchRule {
        cookie: 1,
        items: vec![
            MatchItem::SenderId(wanted.id()),
            MatchItem::BloomMask(mask.0.clone()),
        ],
    })?;

    let filter = BloomFilter::from_keys(&params, &["k.e.y"]);
    wanted.send(broadcast(filter.clone(), 1))?;
    unwanted.send(broadcast(filter.clone(), 2))?;
    assert_eq!(drain_cookies(&subscriber), vec![1]);

    // Adding an unrelated rule does not change the earlier decision.
    subscriber.match_add(MatchRule {
        cookie: 2,
        items: vec![MatchItem::SenderName("com.never.Matches".into())],
    })?;
    wanted.send(broadcast(filter, 3))?;
    assert_eq!(drain_cookies(&subscriber), vec![3]);
    Ok(())
}

/// Monitors also mirror unicast traffic, without being addressable.
#[test]
fn monitor_mirrors_unicast() -> Result<()> {
    let (_domain, bus) = setup("tap")?;
    let ep = bus.default_endpoint();
    let (a, _) = ep.hello(HelloRequest::default())?;
    let (b, _) = ep.hello(HelloRequest::default())?;
    let (monitor, _) = ep.hello(HelloRequest {
        role: Role::Monitor,
        ..Default::default()
    })?;

    a.send(Message {
        dst_id: Some(b.id()),
        cookie: 31,
        items: vec![Item::PayloadVec(b"tapped".to_vec())],
        ..Default::default()
    })?;

    assert_eq!(b.queue_len(), 1);
    assert_eq!(drain_cookies(&monitor), vec![31]);
    Ok(())
}

/// Match rules can be removed by cookie; a removed subscription stops
/// deliveries.
#[test]
fn match_remove_stops_delivery() -> Result<()> {
    let (_domain, bus) = setup("matchrm")?;
    let params = bus.bloom_params();
    let ep = bus.default_endpoint();
    let (sender, _) = ep.hello(HelloRequest::default())?;
    let (subscriber, _) = ep.hello(HelloRequest::default())?;

    let mask = BloomFilter::from_keys(&params, &["x.y"]);
    subscriber.match_add(MatchRule {
        cookie: 5,
        items: vec![MatchItem::BloomMask(mask.0.clone())],
    })?;
    sender.send(broadcast(BloomFilter::from_keys(&params, &["x.y"]), 1))?;
    subscriber.match_remove(5)?;
    sender.send(broadcast(BloomFilter::from_keys(&params, &["x.y"]), 2))?;

    assert_eq!(drain_cookies(&subscriber), vec![1]);
    Ok(())
}
