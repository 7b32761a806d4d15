// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios: write a table, seal it, read it back.

use std::sync::Arc;

use bytes::Bytes;
use permafrost::{
    AtomicCell, BoundKind, Cell, ClusteringPrefix, ClusteringRange, ClusteringSlice, ColumnType,
    CompressionParams, DecoratedKey, Descriptor, EncodingStats, Murmur3Partitioner, Partitioner,
    RangeTombstone, ReadOptions, Row, Schema, SsTableEvent, SsTableOptions, SsTableWriter,
    Tombstone, Value, Version,
};

fn dk(pk: i32) -> DecoratedKey {
    let key = Value::Int(pk).serialize();
    DecoratedKey::new(Murmur3Partitioner.token(&key), key)
}

fn ck(values: &[i32]) -> ClusteringPrefix {
    ClusteringPrefix::from_values(values.iter().map(|v| Value::Int(*v).serialize()))
}

fn int_cell(timestamp: i64, value: i32) -> Cell {
    Cell::Atomic(AtomicCell::live(timestamp, Value::Int(value).serialize()))
}

fn tomb(timestamp: i64) -> Tombstone {
    Tombstone {
        timestamp,
        local_deletion_time: 1_600_000_000,
    }
}

async fn collect(reader: &mut permafrost::SsTableReader) -> Vec<SsTableEvent> {
    let mut events = vec![];
    while let Some(event) = reader.next().await.unwrap() {
        events.push(event);
    }
    events
}

async fn create_writer(
    dir: &std::path::Path,
    schema: Arc<Schema>,
    options: SsTableOptions,
) -> SsTableWriter {
    SsTableWriter::create(
        Descriptor::new(dir, Version::Mc, 1),
        schema,
        options,
        128,
        EncodingStats::default(),
    )
    .await
    .unwrap()
}

/// Scenario 1: clustering slice filtering with a static row.
#[tokio::test]
async fn filtering_with_static_row() {
    let schema = Schema::builder("ks", "t")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .static_column("s", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    writer
        .write_static_row(Row::new().with_cell(0, int_cell(1, 1)))
        .await
        .unwrap();
    for i in 101..=110 {
        writer
            .write_row(ck(&[i]), Row::new().with_cell(0, int_cell(1, 900 + i)))
            .await
            .unwrap();
    }
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    let slice = ClusteringSlice::of(vec![
        ClusteringRange::new(Some((ck(&[102]), true)), Some((ck(&[104]), false))),
        ClusteringRange::new(Some((ck(&[106]), false)), Some((ck(&[108]), true))),
    ]);
    let mut reader = table
        .reader(ReadOptions {
            slice: Some(slice),
            ..Default::default()
        })
        .await
        .unwrap();
    let events = collect(&mut reader).await;

    let expected = vec![
        SsTableEvent::PartitionStart {
            key: dk(1),
            tombstone: None,
        },
        SsTableEvent::StaticRow(Row::new().with_cell(0, int_cell(1, 1))),
        SsTableEvent::Row {
            clustering: ck(&[102]),
            row: Row::new().with_cell(0, int_cell(1, 1002)),
        },
        SsTableEvent::Row {
            clustering: ck(&[103]),
            row: Row::new().with_cell(0, int_cell(1, 1003)),
        },
        SsTableEvent::Row {
            clustering: ck(&[107]),
            row: Row::new().with_cell(0, int_cell(1, 1007)),
        },
        SsTableEvent::Row {
            clustering: ck(&[108]),
            row: Row::new().with_cell(0, int_cell(1, 1008)),
        },
        SsTableEvent::PartitionEnd,
    ];
    assert_eq!(events, expected);
}

/// Scenario 2: a wide partition read sequentially and through the
/// promoted index, with strictly fewer data reads when forwarding.
#[tokio::test]
async fn wide_partition_forwarding_reads_less() {
    let schema = Schema::builder("ks", "wide")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Blob)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut options = SsTableOptions::default();
    options.promoted_index_block_size = 64 * 1024;
    options.buffer_size = 16 * 1024;

    let payload = Bytes::from(vec![0xabu8; 1024]);
    let mut writer = create_writer(dir.path(), schema.clone(), options.clone()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    for i in 0..1024 {
        writer
            .write_row(
                ck(&[i]),
                Row::new().with_cell(0, Cell::Atomic(AtomicCell::live(1, payload.clone()))),
            )
            .await
            .unwrap();
    }
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    // Full sequential scan.
    let mut full = table.reader(ReadOptions::default()).await.unwrap();
    let full_events = collect(&mut full).await;
    assert_eq!(full_events.len(), 1024 + 2);
    let full_reads = full.data_reads();

    // Forwarded scan of [316, 379).
    let mut forwarded = table
        .reader(ReadOptions {
            row_forwarding: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(matches!(
        forwarded.next().await.unwrap(),
        Some(SsTableEvent::PartitionStart { .. })
    ));
    assert_eq!(forwarded.next().await.unwrap(), None);
    forwarded
        .fast_forward_clustering(ClusteringRange::new(
            Some((ck(&[316]), true)),
            Some((ck(&[379]), false)),
        ))
        .await
        .unwrap();
    let mut rows = vec![];
    while let Some(event) = forwarded.next().await.unwrap() {
        match event {
            SsTableEvent::Row { clustering, .. } => rows.push(clustering),
            other => panic!("unexpected event {other:?}"),
        }
    }
    let expected: Vec<_> = (316..=378).map(|i| ck(&[i])).collect();
    assert_eq!(rows, expected);

    let forwarded_reads = forwarded.data_reads();
    assert!(
        forwarded_reads < full_reads,
        "forwarding must read less: {forwarded_reads} vs {full_reads}"
    );
}

/// Scenario 3: interleaved range tombstones around every row, merged
/// into boundaries on disk and split back apart on read.
#[tokio::test]
async fn interleaved_range_tombstones() {
    let schema = Schema::builder("ks", "rt")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck1", ColumnType::Int)
        .clustering("ck2", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    let steps: Vec<i32> = (1..=131_066).step_by(5).collect();
    for &i in &steps {
        writer
            .write_range_tombstone(
                RangeTombstone::new(
                    ck(&[i]),
                    BoundKind::InclStart,
                    ck(&[i + 3, i + 3]),
                    BoundKind::InclEnd,
                    tomb(i as i64),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        writer
            .write_row(
                ck(&[i + 3, i + 3]),
                Row::new().with_cell(0, int_cell(1, i + 3)),
            )
            .await
            .unwrap();
        writer
            .write_range_tombstone(
                RangeTombstone::new(
                    ck(&[i + 3, i + 3]),
                    BoundKind::ExclStart,
                    ck(&[i + 4]),
                    BoundKind::InclEnd,
                    tomb(i as i64 + 1),
                )
                .unwrap(),
            )
            .await
            .unwrap();
    }
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    let mut reader = table.reader(ReadOptions::default()).await.unwrap();
    let mut events = collect(&mut reader).await.into_iter();

    assert_eq!(
        events.next().unwrap(),
        SsTableEvent::PartitionStart {
            key: dk(1),
            tombstone: None
        }
    );
    for &i in &steps {
        assert_eq!(
            events.next().unwrap(),
            SsTableEvent::RangeTombstone(
                RangeTombstone::new(
                    ck(&[i]),
                    BoundKind::InclStart,
                    ck(&[i + 3, i + 3]),
                    BoundKind::InclEnd,
                    tomb(i as i64),
                )
                .unwrap()
            ),
            "leading tombstone of i={i}"
        );
        assert_eq!(
            events.next().unwrap(),
            SsTableEvent::Row {
                clustering: ck(&[i + 3, i + 3]),
                row: Row::new().with_cell(0, int_cell(1, i + 3)),
            },
            "row of i={i}"
        );
        assert_eq!(
            events.next().unwrap(),
            SsTableEvent::RangeTombstone(
                RangeTombstone::new(
                    ck(&[i + 3, i + 3]),
                    BoundKind::ExclStart,
                    ck(&[i + 4]),
                    BoundKind::InclEnd,
                    tomb(i as i64 + 1),
                )
                .unwrap()
            ),
            "trailing tombstone of i={i}"
        );
    }
    assert_eq!(events.next().unwrap(), SsTableEvent::PartitionEnd);
    assert_eq!(events.next(), None);
}

/// Scenario 4: adjacent range tombstones serialize as a single boundary
/// marker of kind `incl_end_excl_start`.
#[tokio::test]
async fn boundary_marker_merging() {
    let schema = Schema::builder("ks", "b")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer.start_partition(dk(7), None).await.unwrap();
    writer
        .write_range_tombstone(
            RangeTombstone::new(
                ck(&[1]),
                BoundKind::InclStart,
                ck(&[5]),
                BoundKind::InclEnd,
                tomb(10),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    writer
        .write_range_tombstone(
            RangeTombstone::new(
                ck(&[5]),
                BoundKind::ExclStart,
                ck(&[9]),
                BoundKind::InclEnd,
                tomb(20),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    // At the event level: two tombstones with the original bounds.
    let mut reader = table.reader(ReadOptions::default()).await.unwrap();
    let events = collect(&mut reader).await;
    assert_eq!(
        events,
        vec![
            SsTableEvent::PartitionStart {
                key: dk(7),
                tombstone: None
            },
            SsTableEvent::RangeTombstone(
                RangeTombstone::new(
                    ck(&[1]),
                    BoundKind::InclStart,
                    ck(&[5]),
                    BoundKind::InclEnd,
                    tomb(10)
                )
                .unwrap()
            ),
            SsTableEvent::RangeTombstone(
                RangeTombstone::new(
                    ck(&[5]),
                    BoundKind::ExclStart,
                    ck(&[9]),
                    BoundKind::InclEnd,
                    tomb(20)
                )
                .unwrap()
            ),
            SsTableEvent::PartitionEnd,
        ]
    );
}

/// Scenario 5: a build that died after writing its TemporaryTOC leaves
/// no trace once recovery runs.
#[tokio::test]
async fn dead_toc_recovery() {
    let schema = Schema::builder("ks", "dead")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    writer
        .write_row(ck(&[1]), Row::new().with_cell(0, int_cell(1, 1)))
        .await
        .unwrap();
    writer.end_partition().await.unwrap();
    // The writer dies here: no finish, no abort.
    drop(writer);

    let cleaned = permafrost::recover_dir(dir.path()).await.unwrap();
    assert_eq!(cleaned, vec![1]);

    let mut entries = std::fs::read_dir(dir.path()).unwrap();
    assert!(
        entries.next().is_none(),
        "recovery must leave no trace behind"
    );
}

/// Scenario 6: collections round-trip with their cell ordering.
#[tokio::test]
async fn collections_roundtrip() {
    let schema = Schema::builder("ks", "coll")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("l", ColumnType::List(Box::new(ColumnType::Text)))
        .regular("s", ColumnType::Set(Box::new(ColumnType::Int)))
        .regular(
            "m",
            ColumnType::Map(Box::new(ColumnType::Int), Box::new(ColumnType::Text)),
        )
        .build();
    let dir = tempfile::tempdir().unwrap();

    // List cells are keyed by a 16-byte timeuuid-like path; sets by the
    // element itself; maps by the key.
    let list_cell = Cell::Collection {
        tombstone: Some(tomb(5)),
        cells: (0u8..4)
            .map(|i| {
                let mut path = vec![0u8; 16];
                path[15] = i;
                (
                    Bytes::from(path),
                    AtomicCell::live(10, Value::Text(format!("item-{i}")).serialize()),
                )
            })
            .collect(),
    };
    let set_cell = Cell::Collection {
        tombstone: None,
        cells: [1, 2, 3]
            .iter()
            .map(|v| (Value::Int(*v).serialize(), AtomicCell::live(10, Bytes::new())))
            .collect(),
    };
    let map_cell = Cell::Collection {
        tombstone: None,
        cells: [(1, "one"), (2, "two")]
            .iter()
            .map(|(k, v)| {
                (
                    Value::Int(*k).serialize(),
                    AtomicCell::live(10, Value::Text((*v).into()).serialize()),
                )
            })
            .collect(),
    };
    let row = Row::new()
        .with_cell(0, list_cell.clone())
        .with_cell(1, set_cell.clone())
        .with_cell(2, map_cell.clone());

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    writer.write_row(ck(&[1]), row.clone()).await.unwrap();
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    let mut reader = table.reader(ReadOptions::default()).await.unwrap();
    let events = collect(&mut reader).await;
    assert_eq!(
        events,
        vec![
            SsTableEvent::PartitionStart {
                key: dk(1),
                tombstone: None
            },
            SsTableEvent::Row {
                clustering: ck(&[1]),
                row,
            },
            SsTableEvent::PartitionEnd,
        ]
    );
}

/// A compressed table reads back identically and checks its chunk CRCs.
#[tokio::test]
async fn compressed_roundtrip() {
    let schema = Schema::builder("ks", "lz4")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Blob)
        .compression(CompressionParams {
            chunk_length: 4096,
            ..CompressionParams::lz4()
        })
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut keys: Vec<(DecoratedKey, i32)> = (0..16).map(|pk| (dk(pk), pk)).collect();
    keys.sort_by(|a, b| a.0.cmp(&b.0));

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    for (key, pk) in &keys {
        writer.start_partition(key.clone(), None).await.unwrap();
        for i in 0..32 {
            let payload = vec![(*pk as u8).wrapping_add(i as u8); 257];
            writer
                .write_row(
                    ck(&[i]),
                    Row::new().with_cell(0, Cell::Atomic(AtomicCell::live(1, payload))),
                )
                .await
                .unwrap();
        }
        writer.end_partition().await.unwrap();
    }
    let table = writer.finish().await.unwrap();

    let mut reader = table.reader(ReadOptions::default()).await.unwrap();
    let events = collect(&mut reader).await;
    assert_eq!(events.len(), 16 * (32 + 2));
    // Partitions come back in token order.
    let starts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SsTableEvent::PartitionStart { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = keys.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(starts, expected);
}

/// Deleting a sealed table removes every component atomically.
#[tokio::test]
async fn atomic_delete() {
    let schema = Schema::builder("ks", "del")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    writer
        .write_row(ck(&[1]), Row::new().with_cell(0, int_cell(1, 1)))
        .await
        .unwrap();
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    table.delete().await.unwrap();
    let mut entries = std::fs::read_dir(dir.path()).unwrap();
    assert!(entries.next().is_none());
}

/// Partition fast-forwarding repositions through summary and index.
#[tokio::test]
async fn partition_fast_forward() {
    let schema = Schema::builder("ks", "ff")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut keys: Vec<DecoratedKey> = (0..64).map(dk).collect();
    keys.sort();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    for key in &keys {
        writer.start_partition(key.clone(), None).await.unwrap();
        writer
            .write_row(ck(&[0]), Row::new().with_cell(0, int_cell(1, 0)))
            .await
            .unwrap();
        writer.end_partition().await.unwrap();
    }
    let table = writer.finish().await.unwrap();

    let target = keys[40].clone();
    let mut reader = table
        .reader(ReadOptions {
            partition_forwarding: true,
            ..Default::default()
        })
        .await
        .unwrap();
    reader
        .fast_forward_to(permafrost::PartitionRange {
            lower: Some((target.clone(), true)),
            upper: None,
        })
        .await
        .unwrap();
    let events = collect(&mut reader).await;
    let starts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SsTableEvent::PartitionStart { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(starts, keys[40..].to_vec());
}

/// Reading with a slice yields the full scan restricted to the slice,
/// with range-tombstone bounds intersected.
#[tokio::test]
async fn slice_is_subsequence_of_full_scan() {
    let schema = Schema::builder("ks", "slice")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    for i in 0..100 {
        if i == 10 {
            writer
                .write_range_tombstone(
                    RangeTombstone::new(
                        ck(&[10]),
                        BoundKind::InclStart,
                        ck(&[20]),
                        BoundKind::InclEnd,
                        tomb(1),
                    )
                    .unwrap(),
                )
                .await
                .unwrap();
        }
        if i == 50 {
            writer
                .write_range_tombstone(
                    RangeTombstone::new(
                        ck(&[50]),
                        BoundKind::InclStart,
                        ck(&[60]),
                        BoundKind::InclEnd,
                        tomb(2),
                    )
                    .unwrap(),
                )
                .await
                .unwrap();
        }
        writer
            .write_row(ck(&[i]), Row::new().with_cell(0, int_cell(1, i)))
            .await
            .unwrap();
    }
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    let mut full = table.reader(ReadOptions::default()).await.unwrap();
    let full_events = collect(&mut full).await;
    assert_eq!(full_events.len(), 2 + 100 + 2);

    let mut sliced = table
        .reader(ReadOptions {
            slice: Some(ClusteringSlice::of(vec![ClusteringRange::new(
                Some((ck(&[15]), true)),
                Some((ck(&[55]), true)),
            )])),
            ..Default::default()
        })
        .await
        .unwrap();
    let events = collect(&mut sliced).await;

    let mut expected = vec![SsTableEvent::PartitionStart {
        key: dk(1),
        tombstone: None,
    }];
    // The first tombstone enters trimmed to the slice start.
    expected.push(SsTableEvent::RangeTombstone(
        RangeTombstone::new(
            ck(&[15]),
            BoundKind::InclStart,
            ck(&[20]),
            BoundKind::InclEnd,
            tomb(1),
        )
        .unwrap(),
    ));
    for i in 15..50 {
        expected.push(SsTableEvent::Row {
            clustering: ck(&[i]),
            row: Row::new().with_cell(0, int_cell(1, i)),
        });
    }
    // The second straddles the slice end and is trimmed there.
    expected.push(SsTableEvent::RangeTombstone(
        RangeTombstone::new(
            ck(&[50]),
            BoundKind::InclStart,
            ck(&[55]),
            BoundKind::InclEnd,
            tomb(2),
        )
        .unwrap(),
    ));
    for i in 50..=55 {
        expected.push(SsTableEvent::Row {
            clustering: ck(&[i]),
            row: Row::new().with_cell(0, int_cell(1, i)),
        });
    }
    expected.push(SsTableEvent::PartitionEnd);
    assert_eq!(events, expected);
}

/// Row liveness, expiring cells sharing the row TTL, deleted cells and
/// shadowable tombstones all survive the trip.
#[tokio::test]
async fn liveness_and_tombstones_roundtrip() {
    let schema = Schema::builder("ks", "live")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("a", ColumnType::Int)
        .regular("b", ColumnType::Int)
        .regular("c", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let liveness = permafrost::LivenessInfo::expiring(1000, 3600, 1_600_003_600);
    let mut row = Row::new()
        .with_liveness(liveness)
        .with_tombstone(tomb(500));
    row.shadowable_tombstone = Some(tomb(600));
    // Cell `a` rides entirely on the row's timestamp and TTL; `b` is
    // deleted; `c` is absent, forcing a missing-columns bitmap.
    row = row
        .with_cell(
            0,
            Cell::Atomic(AtomicCell::expiring(
                1000,
                Value::Int(7).serialize(),
                3600,
                1_600_003_600,
            )),
        )
        .with_cell(1, Cell::Atomic(AtomicCell::deleted(900, 1_600_000_100)));

    let partition_tombstone = Some(tomb(50));
    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer
        .start_partition(dk(3), partition_tombstone)
        .await
        .unwrap();
    writer.write_row(ck(&[1]), row.clone()).await.unwrap();
    writer.end_partition().await.unwrap();
    let table = writer.finish().await.unwrap();

    let mut reader = table.reader(ReadOptions::default()).await.unwrap();
    let events = collect(&mut reader).await;
    assert_eq!(
        events,
        vec![
            SsTableEvent::PartitionStart {
                key: dk(3),
                tombstone: partition_tombstone,
            },
            SsTableEvent::Row {
                clustering: ck(&[1]),
                row,
            },
            SsTableEvent::PartitionEnd,
        ]
    );
}

/// Out-of-order writes are refused.
#[tokio::test]
async fn out_of_order_is_refused() {
    let schema = Schema::builder("ks", "ord")
        .partition_key("pk", ColumnType::Int)
        .clustering("ck", ColumnType::Int)
        .regular("val", ColumnType::Int)
        .build();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = create_writer(dir.path(), schema.clone(), SsTableOptions::default_for_test()).await;
    writer.start_partition(dk(1), None).await.unwrap();
    writer
        .write_row(ck(&[5]), Row::new().with_cell(0, int_cell(1, 5)))
        .await
        .unwrap();
    let err = writer
        .write_row(ck(&[4]), Row::new().with_cell(0, int_cell(1, 4)))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        permafrost::ErrorKind::OutOfOrder(_)
    ));
    writer.abort().await;
}
