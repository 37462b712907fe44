use bytes::Bytes;
use parquedb_types::blob_storage::BlobStorage;

#[tokio::test]
async fn test_put_get_head_delete() {
    let storage = BlobStorage::in_memory();
    storage
        .put("data/posts/pending/a.parquet", Bytes::from_static(b"hello"))
        .await
        .unwrap();

    let meta = storage
        .head("data/posts/pending/a.parquet")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.size, 5);

    let bytes = storage.read_blob("data/posts/pending/a.parquet").await.unwrap();
    assert_eq!(&bytes[..], b"hello");

    storage.delete("data/posts/pending/a.parquet").await.unwrap();
    assert!(storage.head("data/posts/pending/a.parquet").await.unwrap().is_none());
}

#[tokio::test]
async fn test_range_read_clamps_past_end() {
    let storage = BlobStorage::in_memory();
    storage.put("blob", Bytes::from_static(b"0123456789")).await.unwrap();

    // fully inside
    let bytes = storage.read_range("blob", 2, 3).await.unwrap();
    assert_eq!(&bytes[..], b"234");

    // straddles the end: shortened, no error
    let bytes = storage.read_range("blob", 8, 10).await.unwrap();
    assert_eq!(&bytes[..], b"89");

    // past the end: empty, no error
    let bytes = storage.read_range("blob", 10, 5).await.unwrap();
    assert!(bytes.is_empty());
    let bytes = storage.read_range("blob", 500, 5).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_conditional_put_does_not_overwrite() {
    let storage = BlobStorage::in_memory();
    assert!(storage.put_if_absent("key", Bytes::from_static(b"first")).await.unwrap());
    assert!(!storage.put_if_absent("key", Bytes::from_static(b"second")).await.unwrap());
    let bytes = storage.read_blob("key").await.unwrap();
    assert_eq!(&bytes[..], b"first");
}

#[tokio::test]
async fn test_delete_batch_tolerates_missing() {
    let storage = BlobStorage::in_memory();
    storage.put("a", Bytes::from_static(b"x")).await.unwrap();
    storage
        .delete_batch(&["a".to_owned(), "never-existed".to_owned()])
        .await
        .unwrap();
    assert!(storage.head("a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_list_and_list_dir() {
    let storage = BlobStorage::in_memory();
    for key in [
        "data/posts/pending/1.parquet",
        "data/posts/pending/2.parquet",
        "data/users/pending/1.parquet",
    ] {
        storage.put(key, Bytes::from_static(b"x")).await.unwrap();
    }
    let files = storage.list("data/posts/pending").await.unwrap();
    assert_eq!(files.len(), 2);

    let page = storage.list_dir("data").await.unwrap();
    assert!(page.files.is_empty());
    assert_eq!(page.prefixes.len(), 2);
}

#[tokio::test]
async fn test_multipart_session() {
    let storage = BlobStorage::in_memory();
    let mut session = storage.create_multipart("big").await.unwrap();
    session.put_part(Bytes::from(vec![1u8; 1024])).await.unwrap();
    session.put_part(Bytes::from(vec![2u8; 1024])).await.unwrap();
    session.complete().await.unwrap();
    let meta = storage.head("big").await.unwrap().unwrap();
    assert_eq!(meta.size, 2048);
}
