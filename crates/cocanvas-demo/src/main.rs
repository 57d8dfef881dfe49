//! Scripted two-client session against the in-memory stores.
//!
//! Usage: `cocanvas-demo [session.json] [data-dir]`. With a data directory
//! the document is persisted to disk instead of kept in memory.

use cocanvas_core::shapes::{SerializableColor, ShapeStyle};
use cocanvas_core::store::{FileDocumentStore, MemoryDocumentStore, MemoryEphemeralBackend};
use cocanvas_core::{
    CanvasSession, Clock, DocumentStore, GeometryPatch, SessionConfig, Shape, SystemClock, UserInfo,
};
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CANVAS_ID: &str = "demo";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    log::info!("Starting CoCanvas demo");

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let documents: Arc<dyn DocumentStore> = match args.next() {
        Some(dir) => Arc::new(FileDocumentStore::new(PathBuf::from(dir))?),
        None => Arc::new(MemoryDocumentStore::new()),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = MemoryEphemeralBackend::new(clock.clone());
    let alice_conn = Arc::new(backend.connect());

    let alice = CanvasSession::connect(
        config.clone(),
        CANVAS_ID,
        UserInfo::new("alice", "Alice", "#e03131"),
        documents.clone(),
        alice_conn.clone(),
        clock.clone(),
    )
    .await?;
    let bob = CanvasSession::connect(
        config,
        CANVAS_ID,
        UserInfo::new("bob", "Bob", "#1971c2"),
        documents,
        Arc::new(backend.connect()),
        clock,
    )
    .await?;

    let ids = alice
        .add_shapes(vec![
            Shape::rectangle(0.0, 0.0, 120.0, 80.0).with_style(ShapeStyle {
                fill: Some(SerializableColor::white()),
                ..ShapeStyle::default()
            }),
            Shape::circle(200.0, 40.0, 30.0).with_z_index(1),
        ])
        .await?;
    log::info!("Bob sees {} shapes", bob.shapes().len());

    // Alice drags both shapes; Bob watches the live edit
    let started = alice.begin_transform(&ids).await?;
    log::info!("Alice transform started: {}", started.success);
    for step in 1..=5 {
        let offset = f64::from(step) * 10.0;
        let patches: HashMap<_, _> = alice
            .shapes()
            .iter()
            .map(|s| (s.id(), GeometryPatch::position(s.shape.x + offset, s.shape.y)))
            .collect();
        alice.transform(&patches).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for shape in bob.shapes() {
        log::info!(
            "Bob sees {} at ({}, {}) locked by {:?}",
            shape.id(),
            shape.shape.x,
            shape.shape.y,
            shape.lock_owner
        );
    }

    let denied = bob.select(ids[0]).await;
    log::info!("Bob selecting a shape Alice holds: {}", denied);

    alice.commit_transform().await?;
    alice.undo().await?;
    alice.redo().await?;
    log::info!("Alice can undo: {}, can redo: {}", alice.can_undo(), alice.can_redo());

    // Alice drops off without saying goodbye
    alice_conn.disconnect();
    log::info!("Bob sees {} peers after Alice dropped", bob.peers().len());
    log::info!("Bob selecting after Alice dropped: {}", bob.select(ids[0]).await);

    bob.disconnect().await;
    log::info!("Final document has {} shapes", bob.document().len());
    Ok(())
}
