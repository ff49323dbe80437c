//! DOM replication across linked peers.
//!
//! Verifies:
//! - Local edits on one replica converge on the other within a few flush windows
//! - Applying remote deltas never produces outbound deltas (no ping-pong)
//! - Edits flow both ways and deletes propagate

use overlay_collab::link::{LinkConfig, LinkManager};
use overlay_collab::protocol::{PeerHello, PeerRole};
use overlay_collab::replicator::{DomReplicator, ReplicatorConfig};
use overlay_collab::transport::{MemoryNetwork, MemoryTransport};
use overlay_collab::validation::{ValidationConfig, Validator};
use overlay_core::{DomTarget, ElementTree};

use std::time::Duration;

fn manager(net: &MemoryNetwork, user: &str, peer: &str) -> LinkManager<MemoryTransport> {
    LinkManager::builder(
        MemoryTransport::new(net),
        PeerHello::new(user, PeerRole::Editor),
        "layer",
    )
    .config(LinkConfig::for_testing())
    .validator(Validator::new(ValidationConfig::for_testing(), "layer"))
    .preferred_peer_id(Some(peer.to_string()))
    .build()
}

fn replica() -> DomReplicator<ElementTree> {
    DomReplicator::new(ElementTree::new("root"), "root", ReplicatorConfig::default()).unwrap()
}

fn text_of(rep: &DomReplicator<ElementTree>, id: &str) -> Option<String> {
    rep.inspect(|t| t.text(id).map(str::to_string))
}

async fn wait_for(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_two_replicas_converge_without_echo() {
    let net = MemoryNetwork::new();
    let a = manager(&net, "alice", "a");
    let b = manager(&net, "bob", "b");
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();
    assert!(wait_for(|| a.is_connected("b") && b.is_connected("a")).await);

    let rep_a = replica();
    let rep_b = replica();
    let task_a = rep_a.attach(&a);
    let task_b = rep_b.attach(&b);

    rep_a.with_target(|t| {
        t.append_marked("root", "note-1", "div").unwrap();
        t.set_text("note-1", "hello").unwrap();
        t.set_attribute("note-1", "data-color", "yellow").unwrap();
        t.set_style("note-1", "left: 10px; top: 20px;").unwrap();
    });

    assert!(wait_for(|| text_of(&rep_b, "note-1").as_deref() == Some("hello")).await);
    let (color, style, parent) = rep_b.inspect(|t| {
        (
            t.attribute("note-1", "data-color").map(str::to_string),
            t.style("note-1").map(str::to_string),
            t.parent("note-1").map(str::to_string),
        )
    });
    assert_eq!(color.as_deref(), Some("yellow"));
    assert_eq!(style.as_deref(), Some("left: 10px; top: 20px;"));
    assert_eq!(parent.as_deref(), Some("root"));

    // Several flush windows pass; the receiving side stays silent.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.stats().sent, 0);
    assert_eq!(rep_b.pending_entities(), 0);

    // And the other way.
    rep_b.with_target(|t| t.set_text("note-1", "edited").unwrap());
    assert!(wait_for(|| text_of(&rep_a, "note-1").as_deref() == Some("edited")).await);

    task_a.abort();
    task_b.abort();
    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_delete_propagates() {
    let net = MemoryNetwork::new();
    let a = manager(&net, "alice", "a");
    let b = manager(&net, "bob", "b");
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();
    assert!(wait_for(|| a.is_connected("b") && b.is_connected("a")).await);

    let rep_a = replica();
    let rep_b = replica();
    let task_a = rep_a.attach(&a);
    let task_b = rep_b.attach(&b);

    rep_a.with_target(|t| t.append_marked("root", "stroke-1", "svg").unwrap());
    assert!(wait_for(|| rep_b.inspect(|t| t.contains("stroke-1"))).await);

    rep_a.with_target(|t| t.remove_element("stroke-1").unwrap());
    assert!(wait_for(|| !rep_b.inspect(|t| t.contains("stroke-1"))).await);

    task_a.abort();
    task_b.abort();
    a.shutdown();
    b.shutdown();
}
