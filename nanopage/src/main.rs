use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use rand::Rng;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use nanopage_format::{
    BulkDataHandle, ClusterFixup, FixupChunk, HierarchyFixup, Lz4Codec, PageDesc, ResourceBuilder,
};
use nanopage_streaming::prelude::*;

/// Levels below the root of every synthetic resource
const TREE_DEPTH: u32 = 4;
const RESOURCES: u32 = 8;
const FRAMES: u32 = 240;
/// Simulated storage throughput per frame
const READ_BYTES_PER_FRAME: u64 = 24 * 1024;

fn parent(page: u32) -> u32 {
    (page - 1) / 2
}

fn level(page: u32) -> u32 {
    (page + 1).ilog2()
}

/// Pages of `level` in a binary tree laid out in heap order
fn level_pages(level: u32) -> std::ops::Range<u32> {
    (1 << level) - 1..(1 << (level + 1)) - 1
}

/// Compressible payload of varying size
fn payload(page: u32, rng: &mut impl Rng) -> Vec<u8> {
    let len: usize = rng.random_range(2048..8192);
    (0..len).map(|i| (page as usize * 31 + i / 64) as u8).collect()
}

/// Binary refinement tree. Every page refines one cluster of its parent and links itself into
/// the parent's hierarchy node.
fn synthetic_resource(name: &str, rng: &mut impl Rng) -> ResourceBuilder {
    let num_pages = (1 << (TREE_DEPTH + 1)) - 1;
    let root = PageDesc {
        fixups: FixupChunk {
            num_clusters: 2,
            ..Default::default()
        },
        payload: payload(0, rng),
        ..Default::default()
    };
    let mut builder = ResourceBuilder::new(name, root).hierarchy_nodes(num_pages);
    for page in 1..num_pages {
        let parent = parent(page);
        let child = (page - 1) % 2;
        builder.page(PageDesc {
            dependencies: if parent == 0 { Vec::new() } else { vec![parent] },
            fixups: FixupChunk {
                num_clusters: 2,
                hierarchy_fixups: vec![HierarchyFixup {
                    page_index: page,
                    node_index: parent,
                    child_index: child,
                    cluster_group_part_start: 0,
                    dependency_start: page,
                    dependency_num: 1,
                }],
                cluster_fixups: vec![ClusterFixup {
                    page_index: parent,
                    cluster_index: child,
                    dependency_start: page,
                    dependency_num: 1,
                }],
            },
            payload: payload(page, rng),
        });
    }
    builder
}

/// Requests for everything a camera at `camera` would see of resource `index`.
fn frame_requests(
    id: ResourceId,
    index: u32,
    camera: u32,
    rng: &mut impl Rng,
    out: &mut Vec<RawRequest>,
) {
    let distance = index.abs_diff(camera);
    let Some(target_level) = TREE_DEPTH.checked_sub(distance) else {
        return;
    };
    if target_level == 0 {
        return;
    }
    let priority = (TREE_DEPTH - distance) * 16;
    let pages = level_pages(target_level);
    let mut first = pages.start;
    while first < pages.end {
        let count = (pages.end - first).min(RawRequest::MAX_PAGES_PER_REQUEST);
        // partially occluded
        if rng.random_bool(0.85) {
            out.push(RawRequest::new(id, first, count, priority + level(first)));
        }
        first += count;
    }
}

fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run(runtime.handle().clone()))
}

async fn run(runtime: tokio::runtime::Handle) -> anyhow::Result<()> {
    let mut rng = rand::rng();
    let config = StreamingConfig {
        max_streaming_pages: 48,
        max_root_pages: 16,
        max_pending_pages: 16,
        max_page_installs_per_update: 8,
        max_selected_pages_per_update: 16,
        max_hierarchy_nodes: 1024,
        readback_buffers: 2,
        ..Default::default()
    };
    let reader = MemoryReader::manual();
    let mut manager = StreamingManager::new(
        config,
        Arc::new(reader.clone()),
        Arc::new(Lz4Codec),
        runtime,
    )?;

    let mut resources = Vec::new();
    let mut bulk = Vec::new();
    for index in 0..RESOURCES {
        let name = format!("mesh_{index}");
        let builder = synthetic_resource(&name, &mut rng);
        let store = BulkDataHandle::new(format!("{name}.pages"));
        bulk.clear();
        let resource = builder.build_into(&Lz4Codec, store.clone(), &mut bulk);
        reader.insert(store, Bytes::copy_from_slice(&bulk));
        let id = manager
            .add(resource)
            .with_context(|| format!("Failed to add {name}"))?;
        resources.push(id);
    }
    tracing::info!(
        "Scene: {} resources of {} pages",
        resources.len(),
        (1u32 << (TREE_DEPTH + 1)) - 1
    );

    let sink = manager.request_sink();
    let start = Instant::now();
    let mut requests = Vec::new();
    let mut uploads = 0usize;
    for frame in 0..FRAMES {
        // camera sweeps across the row of resources and back
        let sweep = frame * 2 * RESOURCES / FRAMES;
        let camera = if sweep < RESOURCES {
            sweep
        } else {
            2 * RESOURCES - 1 - sweep
        };
        requests.clear();
        for (index, id) in resources.iter().enumerate() {
            frame_requests(*id, index as u32, camera, &mut rng, &mut requests);
        }
        sink.submit(&requests);

        reader.complete_bytes(READ_BYTES_PER_FRAME);
        manager.begin_update();
        manager.end_update().await;
        uploads += manager.take_uploads().len();

        // swap one resource for a fresh copy mid run
        if frame == FRAMES / 2 {
            let old = resources[0];
            manager.remove(old)?;
            let builder = synthetic_resource("mesh_0_reloaded", &mut rng);
            let store = BulkDataHandle::new("mesh_0_reloaded.pages");
            let (resource, data) = builder.build(&Lz4Codec, store.clone());
            reader.insert(store, data);
            resources[0] = manager.add(resource)?;
            tracing::info!("Reloaded {old:?} as {:?}", resources[0]);
        }
    }

    let stats = manager.stats();
    let lifetime = stats.lifetime();
    tracing::info!(
        "{} updates in {:?}: {} requests ({} stale), {} installed, {} evicted, {} budget drops, {} uploads",
        stats.cycles,
        start.elapsed(),
        lifetime.requests,
        lifetime.stale_requests,
        lifetime.installed,
        lifetime.evicted,
        lifetime.budget_drops,
        uploads
    );
    let resident = resources
        .iter()
        .map(|id| {
            (1..(1 << (TREE_DEPTH + 1)) - 1)
                .filter(|page| manager.is_page_resident(PageKey::new(*id, *page)))
                .count()
        })
        .collect::<Vec<_>>();
    tracing::info!("Resident pages per resource: {resident:?}");
    Ok(())
}
