use rls_balancer::balancer::{ConnectivityState, RLS_DATA_HEADER};
use rls_balancer::config::NameMatcher;
use rls_balancer::control_channel::LookupReason;
use rls_balancer::error::{PickError, PickResultLabel, RlsError};
use std::sync::atomic::Ordering;
use std::time::Duration;

mod common;
use common::*;

/// Test picks routed through the balancer against fake collaborators
mod picker_flow_tests {
    use super::*;

    /// Test a cache miss queues the RPC and the response routes it to the target
    #[tokio::test]
    async fn test_miss_then_delegate() {
        let h = Harness::new(FakeLookupClient::returning(&["t1"], "hd-1"), never_throttle());
        h.balancer.update_config(route_lookup_config()).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;
        assert_eq!(picker.channel_target(), "echo.example.com");
        assert_eq!(picker.default_target(), None);

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));

        let picker = h.conn.wait_for_updates(2).await;
        let request = h.client.last_request().unwrap();
        assert_eq!(request.target_type, "grpc");
        assert_eq!(request.reason, LookupReason::Miss);
        assert_eq!(request.key_map.get("user").map(String::as_str), Some("alice"));
        assert!(request.stale_header_data.is_empty());
        assert!(h.group.events().contains(&"add t1 pick_first".to_string()));

        // Child exists but has not connected yet
        assert_eq!(picker.pick(&info), Err(PickError::Queue));

        h.balancer
            .update_child_state("t1", ConnectivityState::Ready, endpoint("t1"));
        let picker = h.conn.wait_for_updates(3).await;
        assert_eq!(h.conn.latest_state(), Some(ConnectivityState::Ready));

        let result = picker.pick(&info).unwrap();
        assert_eq!(result.endpoint, "t1");
        assert_eq!(result.metadata.get(RLS_DATA_HEADER).unwrap(), "hd-1");
        assert_eq!(h.client.request_count(), 1);

        let stats = h.balancer.cache_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.pending_lookups, 0);
        assert_eq!(
            stats.size_bytes,
            ("/echo.Echo/Unary".len() + "user=alice".len() + "hd-1".len()) as u64
        );

        let picks = h.metrics.target_picks.lock().clone();
        assert_eq!(picks, vec![("t1".to_string(), PickResultLabel::Complete)]);
    }

    /// Test concurrent identical picks trigger a single lookup
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_picks_deduplicated() {
        let client = FakeLookupClient::returning(&["t1"], "");
        client.set_delay(Duration::from_millis(200));
        let h = Harness::new(client, never_throttle());
        h.balancer.update_config(route_lookup_config()).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let picker = picker.clone();
                std::thread::spawn(move || picker.pick(&pick_info("bob")))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(PickError::Queue));
        }
        assert_eq!(h.balancer.cache_stats().pending_lookups, 1);

        h.conn.wait_for_updates(2).await;
        assert_eq!(h.client.request_count(), 1);
        assert_eq!(h.balancer.cache_stats().pending_lookups, 0);
    }

    /// Test different keys are looked up independently
    #[tokio::test]
    async fn test_distinct_keys_lookup_separately() {
        let h = Harness::new(FakeLookupClient::returning(&["t1"], ""), never_throttle());
        h.balancer.update_config(route_lookup_config()).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        assert_eq!(picker.pick(&pick_info("alice")), Err(PickError::Queue));
        assert_eq!(picker.pick(&pick_info("bob")), Err(PickError::Queue));
        h.conn.wait_for_updates(3).await;

        assert_eq!(h.client.request_count(), 2);
        assert_eq!(h.balancer.cache_stats().entries, 2);
        // Both entries share one child policy
        assert_eq!(h.balancer.child_policy("t1").unwrap().ref_count(), 2);
    }

    /// Test key values containing separators get their own cache entry
    #[tokio::test]
    async fn test_separator_in_key_value_not_shared() {
        let h = Harness::new(FakeLookupClient::returning(&["t1"], ""), never_throttle());
        let mut config = route_lookup_config();
        config.key_builders[0].headers.push(NameMatcher {
            key: "zone".to_string(),
            names: vec!["x-zone".to_string()],
            required_match: false,
        });
        h.balancer.update_config(config).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let folded = pick_info("a,zone=b");
        let mut split = pick_info("a");
        split.metadata.insert("x-zone", "b".parse().unwrap());

        assert_eq!(picker.pick(&folded), Err(PickError::Queue));
        assert_eq!(picker.pick(&split), Err(PickError::Queue));
        h.conn.wait_for_updates(3).await;

        assert_eq!(h.client.request_count(), 2);
        assert_eq!(h.balancer.cache_stats().entries, 2);

        let requests = h.client.requests.lock().clone();
        let key_maps: Vec<_> = requests.iter().map(|r| r.key_map.clone()).collect();
        assert!(key_maps.iter().any(|m| m.len() == 1 && m["user"] == "a,zone=b"));
        assert!(key_maps.iter().any(|m| m.len() == 2 && m["user"] == "a" && m["zone"] == "b"));
    }

    /// Test a failed lookup without default target fails picks during backoff
    #[tokio::test]
    async fn test_backoff_without_default_fails() {
        let h = Harness::new(FakeLookupClient::failing("lookup server down"), never_throttle());
        h.balancer.update_config(route_lookup_config()).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        let picker = h.conn.wait_for_updates(2).await;

        match picker.pick(&info) {
            Err(PickError::Failed(RlsError::Unavailable { message })) => {
                assert_eq!(
                    message,
                    "most recent error from route lookup server: lookup server down"
                );
            }
            other => panic!("unexpected pick result: {:?}", other),
        }

        // No new lookup while in backoff
        assert_eq!(h.client.request_count(), 1);
        assert_eq!(h.metrics.failed_picks.load(Ordering::SeqCst), 1);
    }

    /// Test a failed lookup routes to the default target during backoff
    #[tokio::test]
    async fn test_backoff_uses_default_target() {
        let h = Harness::new(FakeLookupClient::failing("lookup server down"), never_throttle());
        let mut config = route_lookup_config();
        config.default_target = Some("default".to_string());
        h.balancer.update_config(config).await.unwrap();
        h.conn.wait_for_updates(1).await;
        assert!(h.group.events().contains(&"add default pick_first".to_string()));

        h.balancer
            .update_child_state("default", ConnectivityState::Ready, endpoint("default"));
        let picker = h.conn.wait_for_updates(2).await;

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        let picker = h.conn.wait_for_updates(3).await;

        let result = picker.pick(&info).unwrap();
        assert_eq!(result.endpoint, "default");
        assert!(result.metadata.get(RLS_DATA_HEADER).is_none());

        let picks = h.metrics.default_picks.lock().clone();
        assert_eq!(picks, vec![("default".to_string(), PickResultLabel::Complete)]);
    }

    /// Test a lookup returning no targets is treated as a failure
    #[tokio::test]
    async fn test_empty_targets_backs_off() {
        let h = Harness::new(FakeLookupClient::returning(&[], "hd"), never_throttle());
        h.balancer.update_config(route_lookup_config()).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        let picker = h.conn.wait_for_updates(2).await;

        match picker.pick(&info) {
            Err(PickError::Failed(RlsError::Unavailable { message })) => {
                assert!(message.contains("no targets"), "{}", message);
            }
            other => panic!("unexpected pick result: {:?}", other),
        }
    }

    /// Test throttled lookups fall back to the default target
    #[tokio::test]
    async fn test_throttled_uses_default_target() {
        let h = Harness::new(FakeLookupClient::returning(&["t1"], ""), always_throttle());
        let mut config = route_lookup_config();
        config.default_target = Some("default".to_string());
        h.balancer.update_config(config).await.unwrap();
        h.balancer
            .update_child_state("default", ConnectivityState::Ready, endpoint("default"));
        let picker = h.conn.wait_for_updates(2).await;

        let result = picker.pick(&pick_info("alice")).unwrap();
        assert_eq!(result.endpoint, "default");
        assert_eq!(h.client.request_count(), 0);

        let stats = h.balancer.cache_stats();
        assert_eq!(stats.pending_lookups, 0);
        assert_eq!(stats.entries, 0);
    }

    /// Test throttled lookups fail the RPC without a default target
    #[tokio::test]
    async fn test_throttled_without_default_fails() {
        let h = Harness::new(FakeLookupClient::returning(&["t1"], ""), always_throttle());
        h.balancer.update_config(route_lookup_config()).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        assert_eq!(
            picker.pick(&pick_info("alice")),
            Err(PickError::Failed(RlsError::Throttled))
        );
        assert_eq!(h.balancer.cache_stats().pending_lookups, 0);
        assert_eq!(h.metrics.failed_picks.load(Ordering::SeqCst), 1);
    }

    /// Test delegation skips children in TRANSIENT_FAILURE
    #[tokio::test]
    async fn test_target_fallthrough() {
        let h = Harness::new(
            FakeLookupClient::returning(&["t1", "t2"], ""),
            never_throttle(),
        );
        h.balancer.update_config(route_lookup_config()).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        h.conn.wait_for_updates(2).await;

        h.balancer.update_child_state(
            "t1",
            ConnectivityState::TransientFailure,
            std::sync::Arc::new(FailingPicker),
        );
        h.balancer
            .update_child_state("t2", ConnectivityState::Ready, endpoint("t2"));
        let picker = h.conn.wait_for_updates(4).await;
        assert_eq!(picker.pick(&info).unwrap().endpoint, "t2");

        // All children failing: the last one is used
        h.balancer.update_child_state(
            "t2",
            ConnectivityState::TransientFailure,
            std::sync::Arc::new(FailingPicker),
        );
        let picker = h.conn.wait_for_updates(5).await;
        assert!(matches!(picker.pick(&info), Err(PickError::Failed(_))));
        assert_eq!(h.conn.latest_state(), Some(ConnectivityState::TransientFailure));

        let picks = h.metrics.target_picks.lock().clone();
        assert_eq!(picks.last(), Some(&("t2".to_string(), PickResultLabel::Fail)));
    }

    /// Test a stale entry keeps serving while it is refreshed
    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_refreshed_in_background() {
        let client = FakeLookupClient::returning(&["t1"], "hd-1");
        let h = Harness::new(client, never_throttle());
        let mut config = route_lookup_config();
        config.stale_age = Some(5);
        h.balancer.update_config(config).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        h.conn.wait_for_updates(2).await;
        h.balancer
            .update_child_state("t1", ConnectivityState::Ready, endpoint("t1"));
        let picker = h.conn.wait_for_updates(3).await;

        h.client.set_fallback(Ok(response(&["t1"], "hd-2")));
        tokio::time::advance(Duration::from_secs(6)).await;

        let result = picker.pick(&info).unwrap();
        assert_eq!(result.metadata.get(RLS_DATA_HEADER).unwrap(), "hd-1");

        h.conn.wait_for_updates(4).await;
        let request = h.client.last_request().unwrap();
        assert_eq!(request.reason, LookupReason::Stale);
        assert_eq!(request.stale_header_data, "hd-1");

        let result = picker.pick(&info).unwrap();
        assert_eq!(result.metadata.get(RLS_DATA_HEADER).unwrap(), "hd-2");
        assert_eq!(h.client.request_count(), 2);
    }

    /// Test a stale entry in backoff keeps serving without another refresh
    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_in_backoff_not_refreshed() {
        let client = FakeLookupClient::returning(&["t1"], "hd-1");
        let h = Harness::new(client, never_throttle());
        let mut config = route_lookup_config();
        config.stale_age = Some(5);
        h.balancer.update_config(config).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        h.conn.wait_for_updates(2).await;
        h.balancer
            .update_child_state("t1", ConnectivityState::Ready, endpoint("t1"));
        let picker = h.conn.wait_for_updates(3).await;

        h.client.set_fallback(Err(RlsError::unavailable("refresh failed")));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(picker.pick(&info).unwrap().endpoint, "t1");
        let picker = h.conn.wait_for_updates(4).await;
        assert_eq!(h.client.request_count(), 2);

        // Still valid, still stale, now backing off
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..3 {
            let result = picker.pick(&info).unwrap();
            assert_eq!(result.endpoint, "t1");
            assert_eq!(result.metadata.get(RLS_DATA_HEADER).unwrap(), "hd-1");
        }
        tokio::task::yield_now().await;

        assert_eq!(h.client.request_count(), 2);
        assert_eq!(h.balancer.cache_stats().pending_lookups, 0);
    }

    /// Test a lookup answer too large for the cache is never stored
    #[tokio::test(start_paused = true)]
    async fn test_oversized_response_not_cached() {
        let oversized = "x".repeat(100);
        let client = FakeLookupClient::returning(&["t1"], &oversized);
        let h = Harness::new(client, never_throttle());
        let mut config = route_lookup_config();
        config.cache_size_bytes = 64;
        config.stale_age = Some(5);
        h.balancer.update_config(config).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        // New key: the answer is rejected and the key backs off
        let alice = pick_info("alice");
        assert_eq!(picker.pick(&alice), Err(PickError::Queue));
        let picker = h.conn.wait_for_updates(2).await;
        match picker.pick(&alice) {
            Err(PickError::Failed(RlsError::Unavailable { message })) => {
                assert!(message.contains("exceeds cache capacity"), "{}", message);
            }
            other => panic!("unexpected pick result: {:?}", other),
        }
        assert!(h.balancer.child_policy("t1").is_none());
        let stats = h.balancer.cache_stats();
        assert_eq!(stats.capacity_bytes, 64);
        assert!(stats.size_bytes <= stats.capacity_bytes);

        // Cached key: an oversized refresh leaves the old answer in place
        let bob = pick_info("bob");
        h.client.push_response(Ok(response(&["t2"], "hd")));
        assert_eq!(picker.pick(&bob), Err(PickError::Queue));
        h.conn.wait_for_updates(3).await;
        h.balancer
            .update_child_state("t2", ConnectivityState::Ready, endpoint("t2"));
        let picker = h.conn.wait_for_updates(4).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(picker.pick(&bob).unwrap().endpoint, "t2");
        let picker = h.conn.wait_for_updates(5).await;
        assert_eq!(h.client.request_count(), 3);

        let result = picker.pick(&bob).unwrap();
        assert_eq!(result.metadata.get(RLS_DATA_HEADER).unwrap(), "hd");
        let stats = h.balancer.cache_stats();
        assert_eq!(stats.entries, 2);
        assert!(stats.size_bytes <= stats.capacity_bytes);
        assert!(h.balancer.child_policy("t1").is_none());
        assert_eq!(h.metrics.cache_size.load(Ordering::SeqCst) as u64, stats.size_bytes);
    }

    /// Test a new target list releases only the targets that were dropped
    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_target_change() {
        let client = FakeLookupClient::returning(&["t1", "t2"], "");
        let h = Harness::new(client, never_throttle());
        let mut config = route_lookup_config();
        config.max_age = Some(10);
        h.balancer.update_config(config).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        let info = pick_info("alice");
        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        h.conn.wait_for_updates(2).await;
        let t2 = h.balancer.child_policy("t2").unwrap();

        h.client.set_fallback(Ok(response(&["t2", "t3"], "")));
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(picker.pick(&info), Err(PickError::Queue));
        h.conn.wait_for_updates(3).await;

        assert!(h.group.removed("t1"));
        assert!(!h.group.removed("t2"));
        assert!(h.balancer.child_policy("t1").is_none());
        assert!(h.balancer.child_policy("t3").is_some());
        assert_eq!(t2.ref_count(), 1);
        assert_eq!(h.client.request_count(), 2);
    }

    /// Test closing the balancer releases children and stops publishing
    #[tokio::test]
    async fn test_close_releases_children() {
        let h = Harness::new(FakeLookupClient::returning(&["t1"], ""), never_throttle());
        let mut config = route_lookup_config();
        config.default_target = Some("default".to_string());
        h.balancer.update_config(config).await.unwrap();
        let picker = h.conn.wait_for_updates(1).await;

        assert_eq!(picker.pick(&pick_info("alice")), Err(PickError::Queue));
        h.conn.wait_for_updates(2).await;

        h.balancer.close().await;
        h.balancer.close().await;
        assert!(h.balancer.is_closed());
        assert!(h.group.removed("t1"));
        assert!(h.group.removed("default"));
        assert!(h.client.closed.load(Ordering::SeqCst));

        let published = h.conn.update_count();
        h.balancer
            .update_child_state("t1", ConnectivityState::Ready, endpoint("t1"));
        assert_eq!(h.conn.update_count(), published);
    }
}
