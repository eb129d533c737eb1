use alpha_importer::document::Document;
use alpha_importer::store::{DocumentStore, StagedDocument};
use alpha_importer::test_support::{TestDatabase, TestDatabaseError};
use serde_json::json;

async fn database() -> Option<TestDatabase> {
    match TestDatabase::new().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping: no container runtime ({})", err);
            None
        }
        Err(err) => panic!("failed to start test database: {}", err),
    }
}

fn staged(id: &str, value: serde_json::Value) -> StagedDocument {
    StagedDocument::new(id, Document::try_from(value).expect("object document"))
}

#[tokio::test]
async fn bulk_upsert_reports_inserted_updated_and_unchanged() {
    let Some(db) = database().await else {
        return;
    };
    let store = db.store();
    store.ping().await.unwrap();

    let first = store
        .bulk_upsert(
            "regular_alphas",
            vec![
                staged("a", json!({"id": "a", "n": 1})),
                staged("b", json!({"id": "b", "n": 1})),
            ],
        )
        .await
        .unwrap();
    assert_eq!(first.inserted, 2);
    assert_eq!(first.updated, 0);
    assert_eq!(first.unchanged, 0);

    let second = store
        .bulk_upsert(
            "regular_alphas",
            vec![
                staged("a", json!({"id": "a", "n": 1})),
                staged("b", json!({"id": "b", "n": 2})),
                staged("c", json!({"id": "c"})),
            ],
        )
        .await
        .unwrap();
    assert_eq!(second.inserted, 1);
    assert_eq!(second.updated, 1);
    assert_eq!(second.unchanged, 1);
    assert!(second.failed.is_empty());

    assert_eq!(store.count("regular_alphas").await.unwrap(), 3);
    assert_eq!(store.count("super_alphas").await.unwrap(), 0);
}

#[tokio::test]
async fn find_by_id_is_scoped_to_the_collection() {
    let Some(db) = database().await else {
        return;
    };
    let store = db.store();

    let body = json!({"id": "x", "settings": {"decay": 3}, "is": {"checks": []}});
    store
        .bulk_upsert("super_alphas", vec![staged("x", body.clone())])
        .await
        .unwrap();

    let found = store.find_by_id("super_alphas", "x").await.unwrap();
    assert_eq!(found, Some(Document::try_from(body).unwrap()));
    assert_eq!(store.find_by_id("regular_alphas", "x").await.unwrap(), None);
    assert_eq!(store.find_by_id("super_alphas", "missing").await.unwrap(), None);
}

#[tokio::test]
async fn migrations_create_the_documents_table() {
    let Some(db) = database().await else {
        return;
    };
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'documents')",
    )
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert!(exists);
}
