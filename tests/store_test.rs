use sottovoce::change::Change;
use sottovoce::store::Store;

async fn setup() -> Store {
    let store = Store::open_in_memory().await.unwrap();
    store.init().await.unwrap();
    store
}

#[tokio::test]
async fn data_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sottovoce.db");

    let store = Store::new(&path).await.unwrap();
    store.init().await.unwrap();
    let erin = store
        .create_profile("erin@example.com", Some("Erin"))
        .await
        .unwrap();
    drop(store);

    let store = Store::new(&path).await.unwrap();
    // Init is idempotent across reopens.
    store.init().await.unwrap();

    let found = store
        .find_profile_by_email("erin@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, erin.id);
    assert_eq!(found.display_name.as_deref(), Some("Erin"));
}

#[tokio::test]
async fn duplicate_emails_are_rejected() {
    let store = setup().await;
    store
        .create_profile("frank@example.com", None)
        .await
        .unwrap();
    assert!(store
        .create_profile("frank@example.com", Some("Frank"))
        .await
        .is_err());
}

#[tokio::test]
async fn directory_listing_excludes_self_and_sorts_by_last_seen() {
    let store = setup().await;
    let me = store.create_profile("me@example.com", None).await.unwrap();
    let idle = store
        .create_profile("idle@example.com", None)
        .await
        .unwrap();
    let fresh = store
        .create_profile("fresh@example.com", None)
        .await
        .unwrap();

    store.touch_last_seen(&fresh.id).await.unwrap();

    let listed = store.list_profiles(&me.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, fresh.id);
    assert_eq!(listed[1].id, idle.id);
    assert!(listed.iter().all(|p| p.id != me.id));
}

#[tokio::test]
async fn pair_history_is_isolated_and_ordered() {
    let store = setup().await;
    let a = store.create_profile("a@example.com", None).await.unwrap();
    let b = store.create_profile("b@example.com", None).await.unwrap();
    let c = store.create_profile("c@example.com", None).await.unwrap();

    store.insert_message(&a.id, &b.id, "first").await.unwrap();
    store.insert_message(&b.id, &a.id, "second").await.unwrap();
    store
        .insert_message(&a.id, &c.id, "other pair")
        .await
        .unwrap();

    let history = store.messages_between(&a.id, &b.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "first");
    assert_eq!(history[1].content, "second");
    assert!(history.iter().all(|m| m.is_between(&a.id, &b.id)));

    // Querying from either side yields the same history.
    let mirrored = store.messages_between(&b.id, &a.id).await.unwrap();
    assert_eq!(
        mirrored.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        history.iter().map(|m| m.id.as_str()).collect::<Vec<_>>()
    );

    let latest = store
        .latest_message_between(&a.id, &b.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.content, "second");
}

#[tokio::test]
async fn mark_read_is_idempotent_and_direction_scoped() {
    let store = setup().await;
    let a = store.create_profile("a@example.com", None).await.unwrap();
    let b = store.create_profile("b@example.com", None).await.unwrap();

    store.insert_message(&a.id, &b.id, "to b").await.unwrap();
    store.insert_message(&b.id, &a.id, "to a").await.unwrap();
    store
        .insert_message(&b.id, &a.id, "to a again")
        .await
        .unwrap();

    assert_eq!(store.count_unread(&b.id, &a.id).await.unwrap(), 2);

    assert_eq!(store.mark_read(&b.id, &a.id).await.unwrap(), 2);
    assert_eq!(store.mark_read(&b.id, &a.id).await.unwrap(), 0);
    assert_eq!(store.count_unread(&b.id, &a.id).await.unwrap(), 0);

    // The opposite direction keeps its own state.
    assert_eq!(store.count_unread(&a.id, &b.id).await.unwrap(), 1);

    let history = store.messages_between(&a.id, &b.id).await.unwrap();
    assert!(history.iter().filter(|m| m.sender_id == b.id).all(|m| m.read));
    assert!(history.iter().filter(|m| m.sender_id == a.id).all(|m| !m.read));
}

#[tokio::test]
async fn inserts_are_announced_on_the_change_feed() {
    let store = setup().await;
    let a = store.create_profile("a@example.com", None).await.unwrap();
    let b = store.create_profile("b@example.com", None).await.unwrap();

    let mut changes = store.subscribe_changes();
    let sent = store
        .insert_message(&a.id, &b.id, "announce me")
        .await
        .unwrap();

    match changes.recv().await.unwrap() {
        Change::MessageInserted(message) => {
            assert_eq!(message.id, sent.id);
            assert!(!message.read);
        }
        other => panic!("expected a message insert, got {:?}", other),
    }
}

#[tokio::test]
async fn profile_saves_are_announced_on_the_change_feed() {
    let store = setup().await;
    let gwen = store
        .create_profile("gwen@example.com", Some("Gwen"))
        .await
        .unwrap();

    let mut changes = store.subscribe_changes();
    let updated = store
        .update_profile(&gwen.id, Some("Gwen B."), Some("https://cdn.example/g.png"))
        .await
        .unwrap();
    assert_eq!(updated.display_name.as_deref(), Some("Gwen B."));
    assert_eq!(updated.avatar_url.as_deref(), Some("https://cdn.example/g.png"));

    match changes.recv().await.unwrap() {
        Change::ProfileSaved(profile) => assert_eq!(profile.id, gwen.id),
        other => panic!("expected a profile save, got {:?}", other),
    }

    // Presence bumps go out as profile saves too.
    store.touch_last_seen(&gwen.id).await.unwrap();
    match changes.recv().await.unwrap() {
        Change::ProfileSaved(profile) => {
            assert!(profile.last_seen >= updated.last_seen);
        }
        other => panic!("expected a profile save, got {:?}", other),
    }

    assert!(store
        .update_profile("missing", Some("X"), None)
        .await
        .is_err());
}

#[tokio::test]
async fn touching_an_unknown_id_is_a_quiet_no_op() {
    let store = setup().await;
    let mut changes = store.subscribe_changes();

    store.touch_last_seen("nobody").await.unwrap();

    // Nothing was published for it.
    assert!(matches!(
        changes.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}
