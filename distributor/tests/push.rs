use std::sync::Arc;
use std::time::Duration;

use data_types::{
    HistogramSample, HistogramValue, Labels, Sample, TenantId, TimeSeries, WriteRequest,
};
use distributor::client::{mock::MockIngesterPool, LabelMatcher};
use distributor::{Distributor, DistributorConfig, Limits, Overrides};
use metric::Registry;
use ring::{InstanceDesc, InstanceState, MemoryKv, Ring, RingConfig, RingDesc};
use stratus_time::{SystemProvider, TimeProvider};

const HOUR_MS: i64 = 60 * 60 * 1000;
const TEN_MINUTES_MS: i64 = 10 * 60 * 1000;

struct TestCluster {
    distributor: Distributor,
    pool: Arc<MockIngesterPool>,
}

fn instance(id: &str, zone: &str, token: u32) -> InstanceDesc {
    InstanceDesc {
        id: id.to_owned(),
        addr: format!("{id}:9095"),
        zone: zone.to_owned(),
        state: InstanceState::Active,
        tokens: vec![token, token + 7, token + 13],
        heartbeat_ts: 0,
    }
}

fn cluster(zone_awareness_enabled: bool, minimize_ingester_requests: bool) -> TestCluster {
    test_helpers::maybe_start_logging();

    let time_provider = Arc::new(SystemProvider::new());
    let ring = Arc::new(Ring::new(
        RingConfig {
            replication_factor: 3,
            zone_awareness_enabled,
            // Static test topology, no lifecycler heartbeating it.
            heartbeat_timeout: Duration::ZERO,
        },
        Arc::<SystemProvider>::clone(&time_provider) as _,
    ));
    let mut desc = RingDesc::default();
    desc.upsert(instance("ingester-1", "zone-a", 1_000_000_000));
    desc.upsert(instance("ingester-2", "zone-b", 2_000_000_000));
    desc.upsert(instance("ingester-3", "zone-c", 3_000_000_000));
    ring.reload(desc);

    let pool = Arc::new(MockIngesterPool::new());
    let registry = Registry::new();
    let distributor = Distributor::new(
        DistributorConfig {
            minimize_ingester_requests,
            ..Default::default()
        },
        Arc::new(Overrides::new(Limits::default(), [])),
        ring,
        None,
        Some(Arc::new(MemoryKv::new()) as _),
        Arc::<MockIngesterPool>::clone(&pool) as _,
        time_provider as _,
        &registry,
    );

    TestCluster { distributor, pool }
}

fn tenant() -> TenantId {
    TenantId::new("tenant-1").unwrap()
}

fn histogram(timestamp: i64) -> HistogramSample {
    HistogramSample {
        timestamp,
        value: HistogramValue::Int {
            count: 3,
            sum: 14.,
            zero_count: 0,
            schema: 0,
            positive_deltas: vec![1, 1, 1],
            negative_deltas: vec![],
        },
    }
}

fn now_ms() -> i64 {
    SystemProvider::new().now().timestamp_millis()
}

#[tokio::test]
async fn test_float_series_round_trip() {
    let cluster = cluster(false, false);
    let t = now_ms() - HOUR_MS;

    let series = TimeSeries {
        labels: Labels::from_pairs([("__name__", "requests"), ("job", "api")]).unwrap(),
        samples: (0..6)
            .map(|i| Sample {
                timestamp: t + i * TEN_MINUTES_MS,
                value: 100. + i as f64 * 10.,
            })
            .collect(),
        ..Default::default()
    };

    let response = cluster
        .distributor
        .push(
            &tenant(),
            WriteRequest {
                timeseries: vec![series],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.http_status(), 200);
    assert_eq!(response.accepted_samples, 6);

    let got = cluster
        .distributor
        .query(
            &tenant(),
            t,
            t + 5 * TEN_MINUTES_MS,
            vec![LabelMatcher::eq("__name__", "requests")],
        )
        .await
        .unwrap();

    assert_eq!(got.len(), 1);
    let values: Vec<f64> = got[0].samples.iter().map(|s| s.value).collect();
    assert_eq!(values, vec![100., 110., 120., 130., 140., 150.]);
}

#[tokio::test]
async fn test_mixed_float_histogram_same_timestamp() {
    let cluster = cluster(false, false);
    let t = now_ms() - HOUR_MS;

    let series = TimeSeries {
        labels: Labels::from_pairs([("__name__", "latency")]).unwrap(),
        samples: (0..3)
            .map(|i| Sample {
                timestamp: t + i * TEN_MINUTES_MS,
                value: i as f64,
            })
            .collect(),
        histograms: (2..6).map(|i| histogram(t + i * TEN_MINUTES_MS)).collect(),
        ..Default::default()
    };

    let response = cluster
        .distributor
        .push(
            &tenant(),
            WriteRequest {
                timeseries: vec![series],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // The whole request is accepted; the conflicting histogram is simply
    // dropped, not an error.
    assert_eq!(response.http_status(), 200);
    assert_eq!(response.accepted_samples, 3);
    assert_eq!(response.accepted_histograms, 3);

    let got = cluster
        .distributor
        .query(
            &tenant(),
            t,
            t + 5 * TEN_MINUTES_MS,
            vec![LabelMatcher::eq("__name__", "latency")],
        )
        .await
        .unwrap();

    assert_eq!(got.len(), 1);
    assert_eq!(got[0].samples.len(), 3);
    assert_eq!(got[0].histograms.len(), 3);
    // The t+20m histogram lost to the float at the same timestamp.
    assert_eq!(got[0].histograms[0].timestamp, t + 3 * TEN_MINUTES_MS);
}

#[tokio::test]
async fn test_request_minimization_spares_one_ingester() {
    let cluster = cluster(true, true);
    let t = now_ms() - HOUR_MS;

    let series = TimeSeries {
        labels: Labels::from_pairs([("__name__", "up")]).unwrap(),
        samples: vec![Sample {
            timestamp: t,
            value: 1.,
        }],
        ..Default::default()
    };
    cluster
        .distributor
        .push(
            &tenant(),
            WriteRequest {
                timeseries: vec![series],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    cluster
        .distributor
        .query(&tenant(), t, t, vec![LabelMatcher::eq("__name__", "up")])
        .await
        .unwrap();

    let calls: Vec<usize> = ["ingester-1", "ingester-2", "ingester-3"]
        .iter()
        .map(|id| cluster.pool.get(id).query_stream_calls())
        .collect();

    // Exactly two ingesters served one QueryStream call each; the third
    // was never contacted.
    assert_eq!(calls.iter().sum::<usize>(), 2);
    assert_eq!(calls.iter().filter(|c| **c == 1).count(), 2);
    assert_eq!(calls.iter().filter(|c| **c == 0).count(), 1);
}

#[tokio::test]
async fn test_write_replicates_to_all_three() {
    let cluster = cluster(false, false);
    let t = now_ms() - HOUR_MS;

    cluster
        .distributor
        .push(
            &tenant(),
            WriteRequest {
                timeseries: vec![TimeSeries {
                    labels: Labels::from_pairs([("__name__", "up")]).unwrap(),
                    samples: vec![Sample {
                        timestamp: t,
                        value: 1.,
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Quorum returns after two acks, but replication still reaches the
    // third replica; give the detached task a moment.
    for _ in 0..100 {
        let stored: usize = ["ingester-1", "ingester-2", "ingester-3"]
            .iter()
            .map(|id| cluster.pool.get(id).series_count())
            .sum();
        if stored == 3 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("write did not replicate to all three ingesters");
}

#[tokio::test]
async fn test_label_queries_merge_across_ingesters() {
    let cluster = cluster(false, false);
    let t = now_ms() - HOUR_MS;

    for (name, job) in [("up", "api"), ("up", "worker"), ("errors", "api")] {
        cluster
            .distributor
            .push(
                &tenant(),
                WriteRequest {
                    timeseries: vec![TimeSeries {
                        labels: Labels::from_pairs([("__name__", name), ("job", job)]).unwrap(),
                        samples: vec![Sample {
                            timestamp: t,
                            value: 1.,
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let names = cluster
        .distributor
        .label_names(&tenant(), t, t, vec![])
        .await
        .unwrap();
    assert_eq!(names, vec!["__name__".to_owned(), "job".to_owned()]);

    let values = cluster
        .distributor
        .label_values(&tenant(), "job".to_owned(), t, t, vec![])
        .await
        .unwrap();
    assert_eq!(values, vec!["api".to_owned(), "worker".to_owned()]);

    let (total, items) = cluster
        .distributor
        .label_values_cardinality(&tenant(), vec!["job".to_owned()], vec![])
        .await
        .unwrap();
    // Three zones: the per-pair count is the max across zones.
    assert_eq!(total, 3);
    assert_eq!(items.len(), 2);
}
