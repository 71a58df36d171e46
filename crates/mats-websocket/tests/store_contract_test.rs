// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Behavior every store backend must show: session ownership, inbox
//! deduplication, the outbox delivery-attempt protocol and request correlations.

#[macro_use]
mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use mats_websocket::{CsafError, CurrentNode, RequestCorrelation, SessionFilter};

backend_tests!(
    registration_is_last_writer_wins_and_stale_deregister_is_ignored,
    created_timestamp_survives_reconnects,
    wrong_user_is_rejected_without_changes,
    concurrent_registrations_keep_one_owner,
    inbox_detects_double_delivery,
    concurrent_inbox_inserts_have_one_winner,
    attempted_outbox_messages_are_not_fetched_until_unmarked,
    outbox_message_for_unknown_session_is_dropped,
    request_correlation_is_consumed_once,
    close_session_removes_everything,
    sessions_are_filtered_and_counted,
    liveliness_is_bumped,
);

fn node(nodename: &str, connection_id: &str) -> Option<CurrentNode> {
    Some(CurrentNode {
        nodename: nodename.to_string(),
        connection_id: connection_id.to_string(),
    })
}

async fn registration_is_last_writer_wins_and_stale_deregister_is_ignored(cluster: Cluster) {
    let Cluster { node_a, node_b } = cluster;
    node_a
        .register_session_at_this_node("s1", "alice", "conn1", &client())
        .await
        .unwrap();
    assert_eq!(
        node_b.get_current_registered_node_for_session("s1").await.unwrap(),
        node(NODE_A, "conn1")
    );

    // The client reconnects at the other node before node A noticed the disconnect.
    node_b
        .register_session_at_this_node("s1", "alice", "conn2", &client())
        .await
        .unwrap();
    node_a
        .deregister_session_from_this_node("s1", "conn1")
        .await
        .unwrap();
    node_b
        .deregister_session_from_this_node("s1", "conn1")
        .await
        .unwrap();
    assert_eq!(
        node_a.get_current_registered_node_for_session("s1").await.unwrap(),
        node(NODE_B, "conn2")
    );

    node_b
        .deregister_session_from_this_node("s1", "conn2")
        .await
        .unwrap();
    assert_eq!(
        node_a.get_current_registered_node_for_session("s1").await.unwrap(),
        None
    );
    assert!(node_a.is_session_exists("s1").await.unwrap(), "deregistered, not closed");
}

async fn created_timestamp_survives_reconnects(cluster: Cluster) {
    let created = cluster
        .node_a
        .register_session_at_this_node("s1", "alice", "conn1", &client())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = cluster
        .node_b
        .register_session_at_this_node("s1", "alice", "conn2", &client())
        .await
        .unwrap();
    assert_eq!(created, again);

    let sessions = cluster.node_a.get_sessions(&SessionFilter::default()).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].created_at, created);
    assert!(sessions[0].liveliness_at > created);
}

async fn wrong_user_is_rejected_without_changes(cluster: Cluster) {
    cluster
        .node_a
        .register_session_at_this_node("s1", "alice", "conn1", &client())
        .await
        .unwrap();

    let err = cluster
        .node_b
        .register_session_at_this_node("s1", "mallory", "conn2", &client())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CsafError::WrongUser { ref session_id, ref user_id } if session_id == "s1" && user_id == "mallory"
    ));

    assert_eq!(
        cluster
            .node_a
            .get_current_registered_node_for_session("s1")
            .await
            .unwrap(),
        node(NODE_A, "conn1")
    );
    let sessions = cluster.node_a.get_sessions(&SessionFilter::default()).await.unwrap();
    assert_eq!(sessions[0].user_id, "alice");
}

async fn concurrent_registrations_keep_one_owner(cluster: Cluster) {
    let client = client();
    let attempts = ["alice", "mallory", "alice", "mallory"]
        .into_iter()
        .enumerate()
        .map(|(i, user_id)| {
            let node = if i % 2 == 0 { &cluster.node_a } else { &cluster.node_b };
            let client = &client;
            async move {
                let result = node
                    .register_session_at_this_node("s1", user_id, &format!("conn{i}"), client)
                    .await;
                (user_id, result)
            }
        });
    let results = futures::future::join_all(attempts).await;

    let sessions = cluster.node_a.get_sessions(&SessionFilter::default()).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let owner = sessions[0].user_id.clone();
    for (user_id, result) in results {
        if user_id == owner {
            assert!(result.is_ok(), "{user_id}: {result:?}");
        } else {
            assert!(matches!(result, Err(CsafError::WrongUser { .. })), "{user_id}: {result:?}");
        }
    }
}

async fn inbox_detects_double_delivery(cluster: Cluster) {
    let store = cluster.node_a;
    store.store_message_id_in_inbox("s1", "cmid-1").await.unwrap();

    let err = store
        .store_message_id_in_inbox("s1", "cmid-1")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CLIENT_MESSAGE_ID_ALREADY_EXISTS");

    let stored = store
        .get_message_from_inbox("s1", "cmid-1")
        .await
        .unwrap()
        .expect("inbox row");
    assert_eq!(stored.full_envelope, None);

    store
        .update_message_in_inbox("s1", "cmid-1", Some(r#"{"t":"RESOLVE"}"#), Some(b"bin"))
        .await
        .unwrap();
    let stored = store
        .get_message_from_inbox("s1", "cmid-1")
        .await
        .unwrap()
        .expect("inbox row");
    assert_eq!(stored.full_envelope.as_deref(), Some(r#"{"t":"RESOLVE"}"#));
    assert_eq!(stored.message_binary.as_deref(), Some(&b"bin"[..]));

    // Ids are per session.
    store.store_message_id_in_inbox("s2", "cmid-1").await.unwrap();

    store
        .delete_message_ids_from_inbox("s1", &ids(&["cmid-1"]))
        .await
        .unwrap();
    assert_eq!(store.get_message_from_inbox("s1", "cmid-1").await.unwrap(), None);
    store.store_message_id_in_inbox("s1", "cmid-1").await.unwrap();
}

async fn concurrent_inbox_inserts_have_one_winner(cluster: Cluster) {
    let attempts = (0..8).map(|i| {
        let node = if i % 2 == 0 { &cluster.node_a } else { &cluster.node_b };
        node.store_message_id_in_inbox("s1", "cmid-race")
    });
    let results = futures::future::join_all(attempts).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
        e,
        CsafError::ClientMessageIdAlreadyExists { .. }
    )));
}

async fn attempted_outbox_messages_are_not_fetched_until_unmarked(cluster: Cluster) {
    let Cluster { node_a, node_b } = cluster;
    node_a
        .register_session_at_this_node("s1", "alice", "conn1", &client())
        .await
        .unwrap();

    // Any node may produce; the answer says where to nudge.
    for smid in ["m0", "m1", "m2"] {
        let holder = node_b
            .store_message_in_outbox(&outbox_message("s1", smid))
            .await
            .unwrap();
        assert_eq!(holder, node(NODE_A, "conn1"));
    }

    let fetched = node_a.get_messages_from_outbox("s1", 10).await.unwrap();
    let smids: Vec<_> = fetched.iter().map(|m| m.server_message_id()).collect();
    assert_eq!(smids, ["m0", "m1", "m2"]);
    assert_eq!(fetched[0].message, outbox_message("s1", "m0"));
    assert!(fetched.iter().all(|m| m.delivery_count == 0 && m.attempt_at.is_none()));
    assert_eq!(node_a.get_messages_from_outbox("s1", 2).await.unwrap().len(), 2);

    node_a
        .outbox_messages_attempted_delivery("s1", &ids(&["m0", "m1"]))
        .await
        .unwrap();
    let fetched = node_a.get_messages_from_outbox("s1", 10).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].server_message_id(), "m2");

    node_a
        .outbox_messages_unmark_attempted_delivery("s1")
        .await
        .unwrap();
    let fetched = node_a.get_messages_from_outbox("s1", 10).await.unwrap();
    let counts: Vec<_> = fetched.iter().map(|m| m.delivery_count).collect();
    assert_eq!(counts, [1, 1, 0], "unmarking keeps delivery counts");

    node_a
        .outbox_messages_complete("s1", &ids(&["m0"]))
        .await
        .unwrap();
    node_a
        .outbox_messages_dead_letter_queue("s1", &ids(&["m1"]))
        .await
        .unwrap();
    node_a
        .outbox_messages_unmark_attempted_delivery("s1")
        .await
        .unwrap();
    let fetched = node_a.get_messages_from_outbox("s1", 10).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].server_message_id(), "m2");
}

async fn outbox_message_for_unknown_session_is_dropped(cluster: Cluster) {
    let holder = cluster
        .node_a
        .store_message_in_outbox(&outbox_message("ghost", "m0"))
        .await
        .unwrap();
    assert_eq!(holder, None);
    assert!(!cluster.node_a.is_session_exists("ghost").await.unwrap());

    // A registered but disconnected session still gets its mail stored.
    cluster
        .node_a
        .register_session_at_this_node("s1", "alice", "conn1", &client())
        .await
        .unwrap();
    cluster
        .node_a
        .deregister_session_from_this_node("s1", "conn1")
        .await
        .unwrap();
    let holder = cluster
        .node_b
        .store_message_in_outbox(&outbox_message("s1", "m0"))
        .await
        .unwrap();
    assert_eq!(holder, None);
    assert_eq!(
        cluster.node_a.get_messages_from_outbox("s1", 10).await.unwrap().len(),
        1
    );
    assert!(cluster
        .node_a
        .get_messages_from_outbox("ghost", 10)
        .await
        .unwrap()
        .is_empty());
}

async fn request_correlation_is_consumed_once(cluster: Cluster) {
    let correlation = RequestCorrelation {
        session_id: "s1".to_string(),
        server_message_id: "smid-7".to_string(),
        requested_at: chrono::DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
            .unwrap(),
        reply_terminator_id: "Shop.replyTerminator".to_string(),
        correlation_text: Some("order-7".to_string()),
        correlation_binary: Some(vec![1, 2, 3]),
    };
    cluster
        .node_a
        .store_request_correlation(&correlation)
        .await
        .unwrap();

    // The reply may arrive at another node.
    let found = cluster
        .node_b
        .get_and_delete_request_correlation("s1", "smid-7")
        .await
        .unwrap();
    assert_eq!(found, Some(correlation));
    assert_eq!(
        cluster
            .node_a
            .get_and_delete_request_correlation("s1", "smid-7")
            .await
            .unwrap(),
        None
    );
}

async fn close_session_removes_everything(cluster: Cluster) {
    let store = cluster.node_a;
    store
        .register_session_at_this_node("s1", "alice", "conn1", &client())
        .await
        .unwrap();
    store.store_message_id_in_inbox("s1", "cmid-1").await.unwrap();
    store
        .store_message_in_outbox(&outbox_message("s1", "m0"))
        .await
        .unwrap();
    store
        .store_request_correlation(&RequestCorrelation {
            session_id: "s1".to_string(),
            server_message_id: "smid-1".to_string(),
            requested_at: Utc::now(),
            reply_terminator_id: "T".to_string(),
            correlation_text: None,
            correlation_binary: None,
        })
        .await
        .unwrap();

    store.close_session("s1").await.unwrap();

    assert!(!store.is_session_exists("s1").await.unwrap());
    assert_eq!(store.get_message_from_inbox("s1", "cmid-1").await.unwrap(), None);
    assert!(store.get_messages_from_outbox("s1", 10).await.unwrap().is_empty());
    assert_eq!(
        store
            .get_and_delete_request_correlation("s1", "smid-1")
            .await
            .unwrap(),
        None
    );
    // Closing twice is harmless.
    store.close_session("s1").await.unwrap();
}

async fn sessions_are_filtered_and_counted(cluster: Cluster) {
    let Cluster { node_a, node_b } = cluster;
    node_a
        .register_session_at_this_node("s1", "alice", "c1", &client())
        .await
        .unwrap();
    node_b
        .register_session_at_this_node(
            "s2",
            "alice",
            "c2",
            &mats_websocket::ClientInfo::new("lib", "backoffice", "2.0.0"),
        )
        .await
        .unwrap();
    node_b
        .register_session_at_this_node("s3", "bob", "c3", &client())
        .await
        .unwrap();
    node_b.deregister_session_from_this_node("s3", "c3").await.unwrap();

    let all = node_a.get_sessions(&SessionFilter::default()).await.unwrap();
    let session_ids: Vec<_> = all.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(session_ids, ["s1", "s2", "s3"]);
    assert_eq!(all[2].nodename, None);
    assert_eq!(all[1].nodename.as_deref(), Some(NODE_B));
    assert_eq!(all[1].client.app_name, "backoffice");

    let cases = [
        (SessionFilter::default(), 3),
        (SessionFilter::active(), 2),
        (SessionFilter::default().user("alice"), 2),
        (SessionFilter::active().user("bob"), 0),
        (SessionFilter::default().app("shop"), 2),
        (SessionFilter::default().app_version_at_or_above("1.5"), 1),
        (SessionFilter::active().user("alice").app("shop"), 1),
    ];
    for (filter, expected) in cases {
        assert_eq!(
            node_a.get_sessions_count(&filter).await.unwrap(),
            expected,
            "{filter:?}"
        );
        assert_eq!(
            node_a.get_sessions(&filter).await.unwrap().len(),
            expected,
            "{filter:?}"
        );
    }
}

async fn liveliness_is_bumped(cluster: Cluster) {
    let store = cluster.node_a;
    store
        .register_session_at_this_node("s1", "alice", "c1", &client())
        .await
        .unwrap();
    store
        .register_session_at_this_node("s2", "alice", "c2", &client())
        .await
        .unwrap();
    let before = store.get_sessions(&SessionFilter::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    store
        .notify_session_liveliness(&ids(&["s1", "unknown"]))
        .await
        .unwrap();

    let after = store.get_sessions(&SessionFilter::default()).await.unwrap();
    assert!(after[0].liveliness_at > before[0].liveliness_at);
    assert_eq!(after[1].liveliness_at, before[1].liveliness_at);
}
