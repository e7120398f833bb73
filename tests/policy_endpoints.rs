use anyhow::Result;
use membus::{
    Access, BusCreateRequest, Domain, EndpointPermissions, Error, HelloRequest, InfoQuery, Item,
    Message, PolicyRule, Principal, Role, UpdateCmd,
};

fn process_uid() -> u32 {
    unsafe { libc::getuid() }
}

fn creds(uid: u32) -> membus::item::Creds {
    membus::item::Creds {
        uid,
        gid: uid,
        pid: 3,
        tid: 3,
    }
}

fn rule(name: &str, principal: Principal, access: Access) -> PolicyRule {
    PolicyRule {
        name: name.into(),
        principal,
        access,
    }
}

fn payload(dst: u64, cookie: u64) -> Message {
    Message {
        dst_id: Some(dst),
        cookie,
        items: vec![Item::PayloadVec(b"p".to_vec())],
        ..Default::default()
    }
}

/// TALK at the default endpoint: denial is reported as PermissionDenied,
/// and a grant keyed to the destination's name opens the path.
#[test]
fn talk_policy_at_default_endpoint() -> Result<()> {
    let domain = Domain::new();
    let bus = domain.create_bus(BusCreateRequest {
        name: format!("{}-talkpol", process_uid()),
        policy: vec![rule("org.service.Door", Principal::World, Access::Talk)],
        ..Default::default()
    })?;
    let ep = bus.default_endpoint();
    let (receiver, _) = ep.hello(HelloRequest::default())?;
    let (stranger, _) = ep.hello(HelloRequest {
        impersonate: Some(creds(7001)),
        ..Default::default()
    })?;

    // The receiver owns nothing yet: nothing grants the stranger talk.
    assert!(matches!(
        stranger.send(payload(receiver.id(), 1)),
        Err(Error::PermissionDenied)
    ));

    receiver.name_acquire("org.service.Door", 0)?;
    stranger.send(payload(receiver.id(), 2))?;
    assert_eq!(receiver.queue_len(), 1);
    Ok(())
}

/// OWN policy gates name acquisition for unprivileged principals.
#[test]
fn own_policy_gates_acquisition() -> Result<()> {
    let domain = Domain::new();
    let bus = domain.create_bus(BusCreateRequest {
        name: format!("{}-ownpol", process_uid()),
        policy: vec![rule("net.claim.*", Principal::User(7002), Access::Own)],
        ..Default::default()
    })?;
    let ep = bus.default_endpoint();
    let (allowed, _) = ep.hello(HelloRequest {
        impersonate: Some(creds(7002)),
        ..Default::default()
    })?;
    let (denied, _) = ep.hello(HelloRequest {
        impersonate: Some(creds(7003)),
        ..Default::default()
    })?;

    allowed.name_acquire("net.claim.Mine", 0)?;
    assert!(matches!(
        denied.name_acquire("net.claim.Other", 0),
        Err(Error::PermissionDenied)
    ));
    Ok(())
}

/// A custom endpoint's policy is authoritative and masks its denials as
/// NotFound so name existence does not leak.
#[test]
fn custom_endpoint_masquerades_denial() -> Result<()> {
    let domain = Domain::new();
    // The bus database grants talk; custom endpoints can only restrict
    // further, and their denials read as NotFound.
    let bus = domain.create_bus(BusCreateRequest {
        name: format!("{}-customep", process_uid()),
        policy: vec![rule("com.hidden.Service", Principal::World, Access::Talk)],
        ..Default::default()
    })?;
    let ep = bus.default_endpoint();
    let (owner, _) = ep.hello(HelloRequest::default())?;
    owner.name_acquire("com.hidden.Service", 0)?;

    // An empty custom database denies everything.
    let custom = bus.create_endpoint("restricted", EndpointPermissions::default(), vec![])?;
    let (outsider, _) = custom.hello(HelloRequest {
        impersonate: Some(creds(7010)),
        ..Default::default()
    })?;

    assert!(matches!(
        outsider.conn_info(InfoQuery::Name("com.hidden.Service".into()), 0),
        Err(Error::NotFound)
    ));
    assert!(matches!(
        outsider.send(Message {
            dst_name: Some("com.hidden.Service".into()),
            cookie: 1,
            items: vec![Item::PayloadVec(b"p".to_vec())],
            ..Default::default()
        }),
        Err(Error::NotFound)
    ));

    // Granting talk through the custom database opens the path again.
    let open = bus.create_endpoint(
        "open",
        EndpointPermissions::default(),
        vec![rule("com.hidden.Service", Principal::World, Access::Talk)],
    )?;
    let (insider, _) = open.hello(HelloRequest {
        impersonate: Some(creds(7011)),
        ..Default::default()
    })?;
    insider.send(Message {
        dst_name: Some("com.hidden.Service".into()),
        cookie: 2,
        items: vec![Item::PayloadVec(b"p".to_vec())],
        ..Default::default()
    })?;
    assert_eq!(owner.queue_len(), 1);

    // Duplicate endpoint names are refused.
    assert!(matches!(
        bus.create_endpoint("open", EndpointPermissions::default(), vec![]),
        Err(Error::AlreadyExists)
    ));
    Ok(())
}

/// A policy holder contributes rules while alive and withdraws them on
/// update or disconnect.
#[test]
fn policy_holder_lifecycle() -> Result<()> {
    let domain = Domain::new();
    let bus = domain.create_bus(BusCreateRequest {
        name: format!("{}-holder", process_uid()),
        ..Default::default()
    })?;
    let ep = bus.default_endpoint();
    let (receiver, _) = ep.hello(HelloRequest::default())?;
    receiver.name_acquire("app.guarded.Svc", 0)?;
    let (stranger, _) = ep.hello(HelloRequest {
        impersonate: Some(creds(7020)),
        ..Default::default()
    })?;

    assert!(matches!(
        stranger.send(payload(receiver.id(), 1)),
        Err(Error::PermissionDenied)
    ));

    let (holder, _) = ep.hello(HelloRequest {
        role: Role::PolicyHolder,
        name: Some("app.guarded.Svc".into()),
        policy: vec![rule("app.guarded.Svc", Principal::World, Access::Talk)],
        ..Default::default()
    })?;
    stranger.send(payload(receiver.id(), 2))?;

    // Withdrawing the rules closes the path again.
    holder.update(UpdateCmd::Policy(vec![]))?;
    assert!(matches!(
        stranger.send(payload(receiver.id(), 3)),
        Err(Error::PermissionDenied)
    ));

    // Policy holders neither send nor receive.
    assert!(matches!(
        holder.send(payload(receiver.id(), 4)),
        Err(Error::PermissionDenied)
    ));
    Ok(())
}

/// Bus creator metadata is readable through any connection's pool.
#[test]
fn bus_creator_info() -> Result<()> {
    let domain = Domain::new();
    let bus = domain.create_bus(BusCreateRequest {
        name: format!("{}-creator", process_uid()),
        ..Default::default()
    })?;
    let (conn, hello) = bus.default_endpoint().hello(HelloRequest::default())?;
    assert_eq!(hello.bus_id, bus.id128());

    let offset = conn.bus_creator_info(membus::meta::attach::CREDS)?;
    let record: membus::ConnInfoRecord = bincode::deserialize(&conn.read_slice(offset)?)?;
    assert!(record.meta.iter().any(|item| matches!(
        item,
        Item::Creds(c) if c.uid == process_uid()
    )));
    Ok(())
}

/// Impersonated connections carry the supplied snapshot, and collection
/// beyond names/description stays frozen.
#[test]
fn impersonated_metadata_is_restricted() -> Result<()> {
    let domain = Domain::new();
    let bus = domain.create_bus(BusCreateRequest {
        name: format!("{}-impostor", process_uid()),
        ..Default::default()
    })?;
    let ep = bus.default_endpoint();
    let (asker, _) = ep.hello(HelloRequest::default())?;
    let (impostor, _) = ep.hello(HelloRequest {
        impersonate: Some(creds(7777)),
        description: Some("impersonated peer".into()),
        ..Default::default()
    })?;
    impostor.name_acquire("io.fake.Name", 0).unwrap_err();

    let offset = asker.conn_info(
        InfoQuery::Id(impostor.id()),
        membus::meta::attach::ALL,
    )?;
    let record: membus::ConnInfoRecord = bincode::deserialize(&asker.read_slice(offset)?)?;
    assert!(record.meta.iter().any(|item| matches!(
        item,
        Item::Creds(c) if c.uid == 7777
    )));
    // The frozen snapshot never grows an executable path.
    assert!(!record.meta.iter().any(|item| matches!(item, Item::Exe(_))));
    assert!(record.meta.iter().any(|item| matches!(
        item,
        Item::ConnDescription(d) if d == "impersonated peer"
    )));
    Ok(())
}
