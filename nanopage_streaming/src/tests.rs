#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use bytes::Bytes;
    use nanopage_format::layout::INVALID_PAGE_INDEX;
    use nanopage_format::{
        BulkDataHandle, ClusterFixup, FixupChunk, HierarchyFixup, Lz4Codec, PageDesc,
        ResourceBuilder,
    };
    use rand::Rng;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(streaming_pages: u32) -> StreamingConfig {
        StreamingConfig {
            max_streaming_pages: streaming_pages,
            max_root_pages: 4,
            max_pending_pages: streaming_pages,
            max_page_installs_per_update: 16,
            max_selected_pages_per_update: 16,
            max_unique_requests: 64,
            readback_buffers: 1,
            page_size: 1024,
            max_clusters_per_page: 8,
            max_hierarchy_nodes: 64,
            max_dependency_depth: 8,
            bandwidth_limit: None,
        }
    }

    fn root() -> PageDesc {
        PageDesc {
            fixups: FixupChunk {
                num_clusters: 4,
                ..Default::default()
            },
            payload: vec![0xAA; 32],
            ..Default::default()
        }
    }

    fn page(index: u8, dependencies: &[u32], fixups: FixupChunk) -> PageDesc {
        PageDesc {
            dependencies: dependencies.to_vec(),
            fixups: FixupChunk {
                num_clusters: fixups.num_clusters.max(1),
                ..fixups
            },
            payload: vec![index; 64],
        }
    }

    fn no_fixups() -> FixupChunk {
        FixupChunk::default()
    }

    /// Refines root cluster `cluster` once pages `dependencies` are committed
    fn refine_root(cluster: u32, dependencies: std::ops::Range<u32>) -> ClusterFixup {
        ClusterFixup {
            page_index: 0,
            cluster_index: cluster,
            dependency_start: dependencies.start,
            dependency_num: dependencies.end - dependencies.start,
        }
    }

    fn resource(name: &str, pages: Vec<PageDesc>) -> ResourceBuilder {
        let mut builder = ResourceBuilder::new(name, root()).hierarchy_nodes(4);
        for page in pages {
            builder.page(page);
        }
        builder
    }

    struct Harness {
        manager: StreamingManager,
        reader: MemoryReader,
        bulk: HashMap<String, Bytes>,
    }

    impl Harness {
        fn new(config: StreamingConfig, reader: MemoryReader) -> Self {
            let manager = StreamingManager::new(
                config,
                Arc::new(reader.clone()),
                Arc::new(Lz4Codec),
                tokio::runtime::Handle::current(),
            )
            .unwrap();
            Self {
                manager,
                reader,
                bulk: HashMap::new(),
            }
        }

        fn add(&mut self, name: &str, builder: &ResourceBuilder) -> ResourceId {
            let handle = BulkDataHandle::new(name);
            let (resource, bulk) = builder.build(&Lz4Codec, handle.clone());
            self.reader.insert(handle, bulk.clone());
            self.bulk.insert(name.to_string(), bulk);
            self.manager.add(resource).unwrap()
        }

        async fn update(&mut self) {
            self.manager.begin_update();
            self.manager.end_update().await;
        }

        fn offset(&self, id: ResourceId, page: PageIndex) -> u64 {
            self.manager.resource(id).unwrap().page_streaming_states[page as usize].bulk_offset
        }

        fn page_at(&self, id: ResourceId, offset: u64) -> PageIndex {
            self.manager
                .resource(id)
                .unwrap()
                .page_streaming_states
                .iter()
                .skip(1)
                .position(|state| state.bulk_offset == offset)
                .unwrap() as PageIndex
                + 1
        }

        fn resident(&self, id: ResourceId, page: PageIndex) -> bool {
            self.manager.is_page_resident(PageKey::new(id, page))
        }

        fn ref_count(&self, id: ResourceId, page: PageIndex) -> Option<u32> {
            self.manager.registry().ref_count(PageKey::new(id, page))
        }

        fn root_gpu_page(&self, id: ResourceId) -> u32 {
            self.manager.gpu_page(PageKey::new(id, 0)).unwrap()
        }

        fn root_leaves(&self, id: ResourceId) -> Vec<bool> {
            let root = self.root_gpu_page(id);
            (0..4)
                .map(|cluster| self.manager.page_store().is_cluster_leaf(root, cluster))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_dependency_pinned_while_dependent_in_flight() {
        let mut h = Harness::new(config(2), MemoryReader::manual());
        let r = h.add(
            "r",
            &resource("r", vec![page(1, &[], no_fixups()), page(2, &[1], no_fixups())]),
        );
        let other = h.add("other", &resource("other", vec![page(1, &[], no_fixups())]));

        h.manager.request_pages(&[(r, 2, 1)]);
        h.manager.begin_update();
        let offsets: Vec<u64> = h.reader.queued().iter().map(|read| read.offset).collect();
        assert_eq!(offsets, vec![h.offset(r, 1), h.offset(r, 2)]);
        assert_eq!(h.ref_count(r, 1), Some(1));
        assert_eq!(h.ref_count(r, 2), Some(0));
        assert_eq!(h.manager.registry().eviction_candidate(), None);
        h.manager.end_update().await;

        let page_one = h.offset(r, 1);
        h.reader.complete_where(|read| read.offset == page_one);
        h.update().await;
        assert!(h.resident(r, 1));
        assert!(!h.resident(r, 2));

        // page 1 is still needed by page 2, which is in flight
        h.manager.request_pages(&[(other, 1, 100)]);
        h.update().await;
        assert!(!h.manager.registry().is_registered(PageKey::new(other, 1)));
        assert_eq!(h.manager.stats().cycle.budget_drops, 1);
        assert_eq!(h.manager.stats().cycle.evicted, 0);

        h.reader.complete_all();
        h.update().await;
        assert!(h.resident(r, 1));
        assert!(h.resident(r, 2));
        assert_eq!(h.ref_count(r, 1), Some(1));
        assert_eq!(h.ref_count(r, 2), Some(0));
    }

    #[tokio::test]
    async fn test_selects_dependencies_before_dependents() {
        let mut h = Harness::new(config(8), MemoryReader::manual());
        // A=1 depends on C=3, target 4 depends on A and B=2
        let r = h.add(
            "dag",
            &resource(
                "dag",
                vec![
                    page(1, &[0, 3], no_fixups()),
                    page(2, &[0], no_fixups()),
                    page(3, &[0], no_fixups()),
                    page(4, &[1, 2], no_fixups()),
                ],
            ),
        );
        h.manager.request_pages(&[(r, 4, 1)]);
        h.manager.begin_update();
        let order: Vec<PageIndex> = h
            .reader
            .queued()
            .iter()
            .map(|read| h.page_at(r, read.offset))
            .collect();
        assert_eq!(order, vec![3, 1, 2, 4]);
        h.manager.end_update().await;

        h.reader.complete_all();
        h.update().await;
        assert!((1..=4).all(|page| h.resident(r, page)));
        assert_eq!(h.manager.stats().cycle.installed, 4);
        assert_eq!(h.ref_count(r, 1), Some(1));
        assert_eq!(h.ref_count(r, 3), Some(1));
    }

    fn fixup_resource() -> ResourceBuilder {
        resource(
            "fixups",
            vec![
                // Y
                page(
                    1,
                    &[],
                    FixupChunk {
                        num_clusters: 1,
                        hierarchy_fixups: Vec::new(),
                        cluster_fixups: vec![refine_root(1, 1..2)],
                    },
                ),
                // X, only complete together with Y
                page(
                    2,
                    &[1],
                    FixupChunk {
                        num_clusters: 1,
                        hierarchy_fixups: vec![HierarchyFixup {
                            page_index: 2,
                            node_index: 0,
                            child_index: 0,
                            cluster_group_part_start: 0,
                            dependency_start: 1,
                            dependency_num: 2,
                        }],
                        cluster_fixups: vec![refine_root(0, 1..3)],
                    },
                ),
            ],
        )
    }

    async fn run_completion_order(dependent_first: bool) -> (u32, Vec<bool>) {
        let mut h = Harness::new(config(4), MemoryReader::manual());
        let r = h.add("fixups", &fixup_resource());
        h.manager.request_pages(&[(r, 2, 1)]);
        h.update().await;

        let first = if dependent_first { 2 } else { 1 };
        let first_offset = h.offset(r, first);
        h.reader.complete_where(|read| read.offset == first_offset);
        h.update().await;

        assert!(!h.resident(r, 2));
        assert_eq!(h.manager.page_store().hierarchy_child(0, 0), INVALID_PAGE_INDEX);
        assert!(h.root_leaves(r)[0]);
        if dependent_first {
            // X waits behind Y in the pipeline
            assert!(!h.resident(r, 1));
            assert_eq!(h.manager.pending_len(), 2);
        } else {
            assert!(h.resident(r, 1));
            assert!(!h.root_leaves(r)[1]);
        }

        h.reader.complete_all();
        h.update().await;
        assert!(h.resident(r, 1) && h.resident(r, 2));
        assert_eq!(
            h.manager.page_store().hierarchy_child(0, 0),
            h.manager.gpu_page(PageKey::new(r, 2)).unwrap()
        );
        (
            h.manager.page_store().hierarchy_child(0, 0),
            h.root_leaves(r),
        )
    }

    #[tokio::test]
    async fn test_fixups_independent_of_completion_order() {
        let dependent_first = run_completion_order(true).await;
        let dependency_first = run_completion_order(false).await;
        assert_eq!(dependent_first, dependency_first);
        assert_eq!(dependent_first.1, vec![false, false, true, true]);
    }

    #[tokio::test]
    async fn test_evicts_least_recent_untouched_page() {
        let mut h = Harness::new(config(2), MemoryReader::new());
        let r = h.add(
            "r",
            &resource(
                "r",
                (1..=3u8)
                    .map(|index| {
                        let page_index = index as u32;
                        page(
                            index,
                            &[],
                            FixupChunk {
                                num_clusters: 1,
                                hierarchy_fixups: Vec::new(),
                                cluster_fixups: vec![refine_root(
                                    page_index - 1,
                                    page_index..page_index + 1,
                                )],
                            },
                        )
                    })
                    .collect(),
            ),
        );

        h.manager.request_pages(&[(r, 1, 1), (r, 2, 1)]);
        h.update().await;
        assert!(h.resident(r, 1) && h.resident(r, 2));
        assert_eq!(h.root_leaves(r), vec![false, false, true, true]);
        let lru: Vec<PageIndex> = h
            .manager
            .registry()
            .lru()
            .map(|info| info.registered_key.unwrap().page)
            .collect();
        assert_eq!(lru, vec![1, 2]);

        // page 1 is the LRU tail but touched by this update's request
        h.manager.request_pages(&[(r, 1, 1), (r, 3, 1)]);
        h.update().await;
        let stats = h.manager.stats().cycle;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.evicted, 1);
        assert!(h.resident(r, 1));
        assert!(!h.resident(r, 2));
        assert!(h.resident(r, 3));
        assert_eq!(h.root_leaves(r), vec![false, true, false, true]);
    }

    #[tokio::test]
    async fn test_remove_orphans_in_flight_pages() {
        let mut h = Harness::new(config(4), MemoryReader::manual());
        let r = h.add("r", &resource("r", vec![page(1, &[], no_fixups())]));
        h.manager.request_pages(&[(r, 1, 1)]);
        h.update().await;
        assert_eq!(h.manager.pending_len(), 1);

        h.manager.remove(r).unwrap();
        assert_eq!(h.manager.remove(r), Err(StreamingError::UnknownResource(r)));
        assert!(h.manager.registry().is_empty());
        assert_eq!(h.manager.registry().free_count(), 3);

        let successor = h.add("s", &resource("s", vec![page(1, &[], no_fixups())]));
        assert_eq!(successor.root_slot(), r.root_slot());
        assert_ne!(successor, r);

        h.reader.complete_all();
        h.manager
            .submit_frame_requests(&[RawRequest::new(r, 1, 1, 10)]);
        h.update().await;
        let stats = h.manager.stats().cycle;
        assert_eq!(stats.stale_requests, 1);
        assert_eq!(stats.installed, 0);
        assert_eq!(stats.selected, 0);
        assert_eq!(h.manager.pending_len(), 0);
        assert_eq!(h.manager.registry().free_count(), 4);
        assert!(!h.resident(successor, 1));
    }

    #[tokio::test]
    async fn test_remove_releases_idle_pages() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let r = h.add(
            "r",
            &resource("r", vec![page(1, &[], no_fixups()), page(2, &[1], no_fixups())]),
        );
        h.manager.request_pages(&[(r, 2, 1)]);
        h.update().await;
        assert!(h.resident(r, 2));

        h.manager.remove(r).unwrap();
        assert_eq!(h.manager.registry().free_count(), 4);
        assert!(!h.resident(r, 0));
        assert!(!h.resident(r, 2));
        assert!(h.manager.gpu_page(PageKey::new(r, 0)).is_none());
    }

    #[tokio::test]
    async fn test_io_failure_retried_next_update() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let r = h.add("r", &resource("r", vec![page(1, &[], no_fixups())]));
        let store = BulkDataHandle::new("r");
        h.reader
            .fail_reads(&store, h.offset(r, 1), std::io::ErrorKind::TimedOut, 1);

        h.manager.request_pages(&[(r, 1, 1)]);
        h.update().await;
        assert_eq!(h.manager.stats().cycle.io_failures, 1);
        assert!(!h.resident(r, 1));

        h.update().await;
        assert!(h.resident(r, 1));
        assert_eq!(h.reader.reads_issued(), 2);
        assert_eq!(h.manager.stats().lifetime().io_failures, 1);
    }

    #[tokio::test]
    async fn test_decompression_failure_keeps_later_pages() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let r = h.add(
            "r",
            &resource("r", vec![page(1, &[], no_fixups()), page(2, &[], no_fixups())]),
        );
        let good = h.bulk["r"].clone();
        let mut corrupt = good.to_vec();
        let header = h.offset(r, 1) as usize;
        // payload size field of page 1
        corrupt[header + 12..header + 16].copy_from_slice(&u32::MAX.to_le_bytes());
        h.reader.insert(BulkDataHandle::new("r"), Bytes::from(corrupt));

        h.manager.request_pages(&[(r, 1, 1), (r, 2, 1)]);
        h.update().await;
        let stats = h.manager.stats().cycle;
        assert_eq!(stats.decompress_failures, 1);
        assert_eq!(stats.installed, 0);
        assert_eq!(h.manager.pending_len(), 2);

        h.reader.insert(BulkDataHandle::new("r"), good);
        h.update().await;
        assert_eq!(h.manager.stats().cycle.installed, 2);
        assert!(h.resident(r, 1) && h.resident(r, 2));
        // page 2 kept its bytes, only page 1 was read again
        assert_eq!(h.reader.reads_issued(), 3);
        assert_eq!(
            h.manager
                .page_store()
                .page(h.manager.gpu_page(PageKey::new(r, 2)).unwrap()),
            &[2u8; 64][..]
        );
    }

    #[tokio::test]
    async fn test_install_and_bandwidth_limits_pace_commits() {
        let limited = [
            StreamingConfig {
                max_page_installs_per_update: 1,
                ..config(4)
            },
            StreamingConfig {
                bandwidth_limit: Some(1),
                ..config(4)
            },
        ];
        for config in limited {
            let mut h = Harness::new(config, MemoryReader::new());
            let r = h.add(
                "r",
                &resource(
                    "r",
                    (1..=3).map(|index| page(index, &[], no_fixups())).collect(),
                ),
            );
            h.manager.request_pages(&[(r, 1, 1), (r, 2, 1), (r, 3, 1)]);
            for installed in 1..=3 {
                h.update().await;
                assert_eq!(h.manager.stats().cycle.installed, 1);
                assert_eq!(
                    (1..=3).filter(|page| h.resident(r, *page)).count(),
                    installed
                );
            }
            assert_eq!(h.manager.pending_len(), 0);
        }
    }

    #[tokio::test]
    async fn test_readback_latency() {
        let mut h = Harness::new(
            StreamingConfig {
                readback_buffers: 3,
                ..config(4)
            },
            MemoryReader::new(),
        );
        let r = h.add("r", &resource("r", vec![page(1, &[], no_fixups())]));
        h.manager
            .submit_frame_requests(&[RawRequest::new(r, 1, 1, 1)]);
        h.update().await;
        h.update().await;
        assert!(!h.resident(r, 1));
        h.update().await;
        assert!(h.resident(r, 1));
    }

    #[tokio::test]
    async fn test_request_sink_from_render_thread() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let r = h.add(
            "r",
            &resource("r", vec![page(1, &[], no_fixups()), page(2, &[1], no_fixups())]),
        );
        let sink = h.manager.request_sink();
        let request = RawRequest::new(r, 1, 2, 3);
        std::thread::spawn(move || {
            assert!(sink.submit_bytes(bytemuck::bytes_of(&request)));
        })
        .join()
        .unwrap();
        h.update().await;
        assert_eq!(h.manager.stats().cycle.requests, 2);
        assert!(h.resident(r, 1) && h.resident(r, 2));
    }

    #[tokio::test]
    async fn test_priority_decides_under_selection_budget() {
        let mut h = Harness::new(
            StreamingConfig {
                max_selected_pages_per_update: 1,
                ..config(4)
            },
            MemoryReader::new(),
        );
        let r = h.add(
            "r",
            &resource("r", vec![page(1, &[], no_fixups()), page(2, &[], no_fixups())]),
        );
        h.manager.request_pages(&[(r, 1, 1), (r, 2, 9)]);
        h.update().await;
        assert!(h.resident(r, 2));
        assert!(!h.resident(r, 1));
        assert_eq!(h.manager.stats().cycle.budget_drops, 1);
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_resources() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let (cyclic, _) = resource(
            "cyclic",
            vec![page(1, &[2], no_fixups()), page(2, &[1], no_fixups())],
        )
        .build(&Lz4Codec, BulkDataHandle::new("cyclic"));
        assert!(matches!(
            h.manager.add(cyclic),
            Err(StreamingError::DependencyInconsistency { .. })
        ));

        let (oversized, _) = resource(
            "oversized",
            vec![PageDesc {
                payload: vec![0; 2048],
                ..Default::default()
            }],
        )
        .build(&Lz4Codec, BulkDataHandle::new("oversized"));
        assert!(matches!(
            h.manager.add(oversized),
            Err(StreamingError::InvalidPage { page: 1, .. })
        ));

        for index in 0..4 {
            h.add(&format!("r{index}"), &resource("r", vec![page(1, &[], no_fixups())]));
        }
        let (extra, _) = resource("extra", vec![page(1, &[], no_fixups())])
            .build(&Lz4Codec, BulkDataHandle::new("extra"));
        assert!(matches!(
            h.manager.add(extra),
            Err(StreamingError::ResourceCapacity {
                what: "root pages",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = StreamingManager::new(
            StreamingConfig {
                max_streaming_pages: 0,
                ..config(4)
            },
            Arc::new(MemoryReader::new()),
            Arc::new(Lz4Codec),
            tokio::runtime::Handle::current(),
        );
        assert!(matches!(result, Err(StreamingError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_root_fixups_applied_on_add() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let builder = ResourceBuilder::new(
            "rooted",
            PageDesc {
                fixups: FixupChunk {
                    num_clusters: 2,
                    hierarchy_fixups: vec![HierarchyFixup {
                        page_index: 0,
                        node_index: 1,
                        child_index: 2,
                        ..Default::default()
                    }],
                    cluster_fixups: Vec::new(),
                },
                payload: vec![7; 16],
                ..Default::default()
            },
        )
        .hierarchy_nodes(2);
        let r = h.add("rooted", &builder);
        let root = h.root_gpu_page(r);
        assert_eq!(h.manager.page_store().page(root), &[7u8; 16][..]);
        assert_eq!(h.manager.page_store().hierarchy_child(1, 2), root);

        h.manager.remove(r).unwrap();
        assert_eq!(
            h.manager.page_store().hierarchy_child(1, 2),
            INVALID_PAGE_INDEX
        );
    }

    #[tokio::test]
    async fn test_orphan_with_failing_read_does_not_block_pipeline() {
        let mut h = Harness::new(config(4), MemoryReader::manual());
        let r = h.add("r", &resource("r", vec![page(1, &[], no_fixups())]));
        h.manager.request_pages(&[(r, 1, 1)]);
        h.update().await;
        assert_eq!(h.manager.pending_len(), 1);

        // the store of a removed resource may never come back
        h.reader.fail_reads(
            &BulkDataHandle::new("r"),
            h.offset(r, 1),
            std::io::ErrorKind::NotFound,
            u32::MAX,
        );
        h.manager.remove(r).unwrap();
        let s = h.add("s", &resource("s", vec![page(1, &[], no_fixups())]));

        for _ in 0..4 {
            h.manager.request_pages(&[(s, 1, 1)]);
            h.reader.complete_all();
            h.update().await;
        }
        assert!(h.resident(s, 1));
        assert_eq!(h.manager.pending_len(), 0);
        assert_eq!(h.manager.registry().free_count(), 3);
        // the orphan was read once and never again
        assert_eq!(h.reader.reads_issued(), 2);
        assert_eq!(h.manager.stats().lifetime().io_failures, 1);
    }

    #[tokio::test]
    async fn test_orphan_with_failing_decode_releases_slot() {
        let mut h = Harness::new(config(4), MemoryReader::manual());
        let r = h.add(
            "r",
            &resource("r", vec![page(1, &[], no_fixups()), page(2, &[], no_fixups())]),
        );
        h.manager.request_pages(&[(r, 1, 1), (r, 2, 1)]);
        h.update().await;

        let mut corrupt = h.bulk["r"].to_vec();
        let header = h.offset(r, 1) as usize;
        corrupt[header + 12..header + 16].copy_from_slice(&u32::MAX.to_le_bytes());
        h.reader.insert(BulkDataHandle::new("r"), Bytes::from(corrupt));
        h.reader.complete_all();
        h.manager.remove(r).unwrap();

        h.update().await;
        let stats = h.manager.stats().cycle;
        assert_eq!(stats.decompress_failures, 1);
        assert_eq!(stats.installed, 0);
        assert_eq!(h.manager.pending_len(), 0);
        assert_eq!(h.manager.registry().free_count(), 4);
        assert_eq!(h.reader.reads_issued(), 2);
    }

    #[tokio::test]
    async fn test_evicted_page_reinstalled_in_same_batch() {
        let mut h = Harness::new(config(2), MemoryReader::manual());
        let refine_own_cluster = |index: u32| FixupChunk {
            num_clusters: 1,
            hierarchy_fixups: if index == 1 {
                vec![HierarchyFixup {
                    page_index: 1,
                    node_index: 0,
                    child_index: 0,
                    cluster_group_part_start: 0,
                    dependency_start: 1,
                    dependency_num: 1,
                }]
            } else {
                Vec::new()
            },
            cluster_fixups: vec![refine_root(index - 1, index..index + 1)],
        };
        let r = h.add(
            "r",
            &resource(
                "r",
                (1..=3u8)
                    .map(|index| page(index, &[], refine_own_cluster(index as u32)))
                    .collect(),
            ),
        );

        h.manager.request_pages(&[(r, 1, 1), (r, 2, 1)]);
        h.update().await;
        h.reader.complete_all();
        h.update().await;
        assert!(h.resident(r, 1) && h.resident(r, 2));
        let first_slot = h.manager.registry().slot_of(PageKey::new(r, 1)).unwrap();

        // page 2 is touched, so page 1 makes room for page 3
        h.manager.request_pages(&[(r, 2, 1), (r, 3, 1)]);
        h.update().await;
        assert_eq!(h.manager.stats().cycle.evicted, 1);
        assert!(!h.manager.registry().is_registered(PageKey::new(r, 1)));
        assert_eq!(
            h.manager.registry().slot_of(PageKey::new(r, 3)),
            Some(first_slot)
        );

        // page 1 comes back before page 3 lands in its old slot
        h.manager.request_pages(&[(r, 1, 1)]);
        h.update().await;
        assert_eq!(h.manager.pending_len(), 2);
        h.manager.take_uploads();

        h.reader.complete_all();
        h.update().await;
        assert_eq!(h.manager.stats().cycle.installed, 2);
        assert!(h.resident(r, 1) && h.resident(r, 3));
        assert!(!h.resident(r, 2));
        let page_one = h.manager.gpu_page(PageKey::new(r, 1)).unwrap();
        assert_ne!(page_one, h.manager.page_store().streaming_page(first_slot));
        assert_eq!(h.manager.page_store().hierarchy_child(0, 0), page_one);
        assert_eq!(h.root_leaves(r), vec![false, true, false, true]);
        // reinstalling page 1 is install only, its hierarchy link is never invalidated
        assert!(!h.manager.take_uploads().iter().any(|upload| matches!(
            upload,
            PageUpload::HierarchyChild { gpu_page, .. } if *gpu_page == INVALID_PAGE_INDEX
        )));
    }

    #[tokio::test]
    async fn test_add_rejects_oversized_stored_page() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let (mut resource, _) = resource("r", vec![page(1, &[], no_fixups())])
            .build(&Lz4Codec, BulkDataHandle::new("r"));
        resource.page_streaming_states[1].bulk_size = u32::MAX;
        assert!(matches!(
            h.manager.add(resource),
            Err(StreamingError::InvalidPage { page: 1, .. })
        ));
        assert_eq!(h.manager.stats().resources, 0);
    }

    #[tokio::test]
    async fn test_uploads_accumulate_until_taken() {
        let mut h = Harness::new(config(4), MemoryReader::new());
        let r = h.add("r", &resource("r", vec![page(1, &[], no_fixups())]));
        h.manager.request_pages(&[(r, 1, 1)]);
        h.update().await;
        h.update().await;
        assert!(h.resident(r, 1));

        // the root written by add and page 1 written by the first update are both still logged
        let root = h.root_gpu_page(r);
        let gpu_page = h.manager.gpu_page(PageKey::new(r, 1)).unwrap();
        let written: Vec<u32> = h
            .manager
            .take_uploads()
            .iter()
            .filter_map(|upload| match upload {
                PageUpload::Page { gpu_page, .. } => Some(*gpu_page),
                _ => None,
            })
            .collect();
        assert_eq!(written, vec![root, gpu_page]);
        assert!(h.manager.take_uploads().is_empty());

        h.update().await;
        assert!(h.manager.take_uploads().is_empty());
    }

    fn random_resource(rng: &mut impl Rng, name: &str) -> ResourceBuilder {
        let num_pages = rng.random_range(2..8u32);
        let pages = (1..num_pages)
            .map(|index| {
                let dependencies: Vec<u32> =
                    (1..index).filter(|_| rng.random_bool(0.3)).collect();
                page(
                    index as u8,
                    &dependencies,
                    FixupChunk {
                        num_clusters: 1,
                        hierarchy_fixups: Vec::new(),
                        cluster_fixups: vec![refine_root(index % 4, index..index + 1)],
                    },
                )
            })
            .collect();
        resource(name, pages)
    }

    fn check_invariants(h: &Harness) {
        let registry = h.manager.registry();
        let infos: Vec<&StreamingPageInfo> = registry.lru().collect();
        for info in infos.iter() {
            let key = info.registered_key.unwrap();
            let resource = h.manager.resource(key.resource).unwrap();
            let dependents = infos
                .iter()
                .filter(|other| {
                    let other = other.registered_key.unwrap();
                    other.resource == key.resource
                        && resource.dependencies(other.page).contains(&key.page)
                })
                .count();
            assert_eq!(info.ref_count as usize, dependents, "{key:?}");
            for dependency in resource.dependencies(key.page) {
                let dependency = PageKey::new(key.resource, *dependency);
                assert!(h.manager.registry().is_registered(dependency) || dependency.page == 0);
                if info.resident_key == Some(key) {
                    assert!(h.manager.is_page_resident(dependency), "{key:?} before {dependency:?}");
                }
            }
        }
        let touches: Vec<u64> = infos.iter().map(|info| info.last_touch).collect();
        assert!(touches.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn test_random_workload_keeps_invariants() {
        let mut rng = rand::rng();
        let mut h = Harness::new(
            StreamingConfig {
                max_pending_pages: 6,
                max_page_installs_per_update: 3,
                ..config(12)
            },
            MemoryReader::manual(),
        );
        let mut names = 0;
        let mut live = Vec::new();
        let mut removed = Vec::new();
        for _ in 0..3 {
            let name = format!("r{names}");
            names += 1;
            let builder = random_resource(&mut rng, &name);
            live.push((h.add(&name, &builder), builder.num_pages()));
        }

        for _ in 0..200 {
            if rng.random_bool(0.05) {
                let (id, _) = live.swap_remove(rng.random_range(0..live.len()));
                h.manager.remove(id).unwrap();
                removed.push(id);
                let name = format!("r{names}");
                names += 1;
                let builder = random_resource(&mut rng, &name);
                live.push((h.add(&name, &builder), builder.num_pages()));
            }

            let mut requests = Vec::new();
            for _ in 0..rng.random_range(0..6) {
                let (id, num_pages) = live[rng.random_range(0..live.len())];
                let first = rng.random_range(1..num_pages);
                let count = rng.random_range(1..=(num_pages - first).min(3));
                requests.push(RawRequest::new(id, first, count, rng.random_range(0..8)));
            }
            if let Some(stale) = removed.last() {
                requests.push(RawRequest::new(*stale, 1, 1, 0));
            }
            h.manager.submit_frame_requests(&requests);
            h.reader.complete_where(|_| rng.random_bool(0.5));
            h.update().await;
            check_invariants(&h);
        }

        for _ in 0..32 {
            h.reader.complete_all();
            h.update().await;
            if h.manager.pending_len() == 0 {
                break;
            }
        }
        assert_eq!(h.manager.pending_len(), 0);
        check_invariants(&h);
        for info in h.manager.registry().lru() {
            assert_eq!(info.resident_key, info.registered_key);
            assert!(!info.in_flight);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_backed_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let builder = resource(
            "file",
            vec![page(1, &[], no_fixups()), page(2, &[1], no_fixups())],
        );
        let (resource, bulk) = builder.build(&Lz4Codec, BulkDataHandle::new("file.pages"));
        std::fs::write(dir.path().join("file.pages"), &bulk).unwrap();

        let runtime = tokio::runtime::Handle::current();
        let mut manager = StreamingManager::new(
            config(4),
            Arc::new(FileReader::new(dir.path(), runtime.clone())),
            Arc::new(Lz4Codec),
            runtime,
        )
        .unwrap();
        let id = manager.add(resource).unwrap();
        let target = PageKey::new(id, 2);
        for _ in 0..400 {
            manager.request_pages(&[(id, 2, 1)]);
            manager.begin_update();
            manager.end_update().await;
            if manager.is_page_resident(target) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.is_page_resident(PageKey::new(id, 1)));
        assert!(manager.is_page_resident(target));
        let gpu_page = manager.gpu_page(target).unwrap();
        assert_eq!(manager.page_store().page(gpu_page), &[2u8; 64][..]);
        assert!(!manager.take_uploads().is_empty());
    }
}
