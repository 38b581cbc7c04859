macro_rules! assert_blob_not_found {
    ($store:expr, $ctx:expr, $hash:expr) => {{
        match $store.read_blob(&$ctx, &$hash).await {
            Ok(_) => panic!("a blob was found for hash `{}`", $hash),
            Err(Error::NotFound { hash }) => assert_eq!(hash, $hash),
            Err(err) => panic!("unexpected error: {}", err),
        };
    }};
}

macro_rules! assert_store_blob {
    ($store:expr, $ctx:expr, $content:expr) => {{
        let hash = $store
            .store_bytes(&$ctx, $content)
            .await
            .expect("failed to store blob");

        assert_eq!(hash, ContentHash::of($content));

        hash
    }};
}

macro_rules! assert_read_blob {
    ($store:expr, $ctx:expr, $hash:expr, $expected_content:expr) => {{
        let content = $store
            .read_blob(&$ctx, &$hash)
            .await
            .expect("failed to read blob");

        assert_eq!(content, $expected_content);
    }};
}

macro_rules! assert_blob_removed {
    ($store:expr, $ctx:expr, $hash:expr) => {{
        $store
            .remove(&$ctx, &$hash)
            .await
            .expect("failed to remove blob");

        assert_blob_not_found!($store, $ctx, $hash);

        match $store.remove(&$ctx, &$hash).await {
            Ok(()) => panic!("removing a missing blob `{}` succeeded", $hash),
            Err(err) => assert!(err.is_not_found(), "unexpected error: {}", err),
        };
    }};
}

pub(crate) use {assert_blob_not_found, assert_blob_removed, assert_read_blob, assert_store_blob};
