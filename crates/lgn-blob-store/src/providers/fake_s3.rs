//! An in-process S3 server, plugged into the SDK as its HTTP client.
//!
//! It understands the path-style requests `ObjectBlobStore` sends and keeps
//! its objects in memory. Every request is logged so that tests can check
//! which keys were written.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use aws_sdk_s3::{
    config::{retry::RetryConfig, BehaviorVersion, Credentials, Region, SharedHttpClient},
    primitives::ByteStream,
};
use aws_smithy_runtime_api::{
    client::{
        http::{
            HttpClient, HttpConnector, HttpConnectorFuture, HttpConnectorSettings,
            SharedHttpConnector,
        },
        orchestrator::{HttpRequest, HttpResponse},
        runtime_components::RuntimeComponents,
    },
    http::StatusCode,
};
use aws_smithy_types::body::SdkBody;

pub(crate) const ENDPOINT: &str = "http://s3.test";

/// The requests that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Operation {
    Copy,
    Delete,
    UploadPart,
}

#[derive(Debug)]
struct Upload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Debug)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    uploads: HashMap<String, Upload>,
    next_upload_id: u64,
    failing: HashSet<Operation>,
    page_size: usize,
    requests: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeS3 {
    state: Arc<Mutex<State>>,
}

impl FakeS3 {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                buckets: BTreeMap::new(),
                uploads: HashMap::new(),
                next_upload_id: 1,
                failing: HashSet::new(),
                page_size: 1000,
                requests: Vec::new(),
            })),
        }
    }

    pub(crate) fn with_bucket(bucket: &str) -> Self {
        let fake = Self::new();
        fake.state().buckets.insert(bucket.to_string(), BTreeMap::new());

        fake
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn has_bucket(&self, bucket: &str) -> bool {
        self.state().buckets.contains_key(bucket)
    }

    pub(crate) fn put(&self, bucket: &str, key: &str, content: &[u8]) {
        self.state()
            .buckets
            .get_mut(bucket)
            .unwrap()
            .insert(key.to_string(), content.to_vec());
    }

    /// Returns the keys of `bucket`, in lexical order.
    pub(crate) fn keys(&self, bucket: &str) -> Vec<String> {
        self.state().buckets[bucket].keys().cloned().collect()
    }

    pub(crate) fn fail(&self, operation: Operation) {
        self.state().failing.insert(operation);
    }

    pub(crate) fn set_page_size(&self, page_size: usize) {
        self.state().page_size = page_size;
    }

    /// Returns the requests received so far, as `<OPERATION> <key>`.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }

    pub(crate) fn http_client(&self) -> SharedHttpClient {
        SharedHttpClient::new(self.clone())
    }

    /// Returns a client that sends every request to this server.
    pub(crate) fn client(&self) -> aws_sdk_s3::Client {
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("access", "secret", None, None, "fake"))
            .endpoint_url(ENDPOINT)
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .http_client(self.http_client())
            .build();

        aws_sdk_s3::Client::from_conf(config)
    }

    fn handle(&self, request: &HttpRequest, body: Vec<u8>) -> HttpResponse {
        let (path, query) = split_uri(request.uri());
        let query = parse_query(query);
        let (bucket, key) = match path.trim_start_matches('/').split_once('/') {
            Some((bucket, key)) if !key.is_empty() => {
                (percent_decode(bucket), Some(percent_decode(key)))
            }
            Some((bucket, _)) => (percent_decode(bucket), None),
            None => (percent_decode(path.trim_start_matches('/')), None),
        };

        let mut state = self.state();

        match key {
            None => state.handle_bucket(request.method(), &bucket, &query),
            Some(key) => state.handle_object(request, body, &bucket, &key, &query),
        }
    }
}

impl State {
    fn handle_bucket(
        &mut self,
        method: &str,
        bucket: &str,
        query: &HashMap<String, String>,
    ) -> HttpResponse {
        match method {
            "HEAD" => {
                self.requests.push(format!("HEAD_BUCKET {}", bucket));

                if self.buckets.contains_key(bucket) {
                    response(200, SdkBody::empty())
                } else {
                    error(404, "NotFound", "Not Found")
                }
            }
            "PUT" => {
                self.requests.push(format!("CREATE_BUCKET {}", bucket));

                if self.buckets.contains_key(bucket) {
                    return error(
                        409,
                        "BucketAlreadyOwnedByYou",
                        "Your previous request to create the named bucket succeeded",
                    );
                }

                self.buckets.insert(bucket.to_string(), BTreeMap::new());

                response(200, SdkBody::empty())
            }
            "GET" if query.get("list-type").map(String::as_str) == Some("2") => {
                self.requests.push(format!("LIST {}", bucket));
                self.list(bucket, query)
            }
            _ => error(501, "NotImplemented", "Not implemented"),
        }
    }

    fn list(&self, bucket: &str, query: &HashMap<String, String>) -> HttpResponse {
        let objects = match self.buckets.get(bucket) {
            Some(objects) => objects,
            None => return error(404, "NoSuchBucket", "The specified bucket does not exist"),
        };

        let prefix = query.get("prefix").cloned().unwrap_or_default();
        let after = query
            .get("continuation-token")
            .or_else(|| query.get("start-after"))
            .cloned();

        let mut page: Vec<_> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| after.as_ref().map_or(true, |after| *key > after))
            .take(self.page_size + 1)
            .collect();

        let truncated = page.len() > self.page_size;
        page.truncate(self.page_size);

        let mut body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <Name>{}</Name><Prefix>{}</Prefix><KeyCount>{}</KeyCount>\
             <MaxKeys>{}</MaxKeys><IsTruncated>{}</IsTruncated>",
            bucket,
            prefix,
            page.len(),
            self.page_size,
            truncated
        );

        for (key, content) in &page {
            body.push_str(&format!(
                "<Contents><Key>{}</Key><Size>{}</Size></Contents>",
                key,
                content.len()
            ));
        }

        if truncated {
            if let Some((last, _)) = page.last() {
                body.push_str(&format!(
                    "<NextContinuationToken>{}</NextContinuationToken>",
                    last
                ));
            }
        }

        body.push_str("</ListBucketResult>");

        xml(200, body)
    }

    fn handle_object(
        &mut self,
        request: &HttpRequest,
        body: Vec<u8>,
        bucket: &str,
        key: &str,
        query: &HashMap<String, String>,
    ) -> HttpResponse {
        if !self.buckets.contains_key(bucket) {
            return error(404, "NoSuchBucket", "The specified bucket does not exist");
        }

        match request.method() {
            "HEAD" => {
                self.requests.push(format!("HEAD {}", key));

                match self.buckets[bucket].get(key) {
                    Some(content) => {
                        let mut response = response(200, SdkBody::empty());
                        response
                            .headers_mut()
                            .insert("content-length", content.len().to_string());

                        response
                    }
                    None => error(404, "NotFound", "Not Found"),
                }
            }
            "GET" => {
                self.requests.push(format!("GET {}", key));

                match self.buckets[bucket].get(key) {
                    Some(content) => {
                        let mut response = response(200, SdkBody::from(content.clone()));
                        response
                            .headers_mut()
                            .insert("content-length", content.len().to_string());

                        response
                    }
                    None => error(404, "NoSuchKey", "The specified key does not exist."),
                }
            }
            "PUT" => {
                if let Some(source) = request.headers().get("x-amz-copy-source") {
                    let source = percent_decode(source);
                    self.copy(bucket, key, &source)
                } else if let (Some(upload_id), Some(part_number)) =
                    (query.get("uploadId"), query.get("partNumber"))
                {
                    self.upload_part(key, upload_id, part_number, body)
                } else {
                    self.requests.push(format!("PUT {}", key));

                    self.buckets
                        .get_mut(bucket)
                        .unwrap()
                        .insert(key.to_string(), body);

                    with_etag(response(200, SdkBody::empty()))
                }
            }
            "POST" if query.contains_key("uploads") => {
                self.requests.push(format!("CREATE_MULTIPART {}", key));

                let upload_id = format!("upload-{}", self.next_upload_id);
                self.next_upload_id += 1;
                self.uploads.insert(
                    upload_id.clone(),
                    Upload {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        parts: BTreeMap::new(),
                    },
                );

                xml(
                    200,
                    format!(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                         <InitiateMultipartUploadResult>\
                         <Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId>\
                         </InitiateMultipartUploadResult>",
                        bucket, key, upload_id
                    ),
                )
            }
            "POST" if query.contains_key("uploadId") => {
                self.requests.push(format!("COMPLETE {}", key));

                let upload = match self.uploads.remove(&query["uploadId"]) {
                    Some(upload) => upload,
                    None => return error(404, "NoSuchUpload", "The upload does not exist"),
                };

                self.buckets
                    .get_mut(&upload.bucket)
                    .unwrap()
                    .insert(upload.key, upload.parts.into_values().flatten().collect());

                xml(
                    200,
                    format!(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                         <CompleteMultipartUploadResult>\
                         <Bucket>{}</Bucket><Key>{}</Key><ETag>\"etag\"</ETag>\
                         </CompleteMultipartUploadResult>",
                        bucket, key
                    ),
                )
            }
            "DELETE" if query.contains_key("uploadId") => {
                self.requests.push(format!("ABORT {}", key));
                self.uploads.remove(&query["uploadId"]);

                response(204, SdkBody::empty())
            }
            "DELETE" => {
                self.requests.push(format!("DELETE {}", key));

                if self.failing.contains(&Operation::Delete) {
                    return error(403, "AccessDenied", "Access Denied");
                }

                self.buckets.get_mut(bucket).unwrap().remove(key);

                response(204, SdkBody::empty())
            }
            _ => error(501, "NotImplemented", "Not implemented"),
        }
    }

    fn copy(&mut self, bucket: &str, key: &str, source: &str) -> HttpResponse {
        self.requests.push(format!("COPY {}", key));

        if self.failing.contains(&Operation::Copy) {
            return error(403, "AccessDenied", "Access Denied");
        }

        let content = source
            .trim_start_matches('/')
            .split_once('/')
            .and_then(|(source_bucket, source_key)| {
                self.buckets.get(source_bucket)?.get(source_key).cloned()
            });

        match content {
            Some(content) => {
                self.buckets
                    .get_mut(bucket)
                    .unwrap()
                    .insert(key.to_string(), content);

                xml(
                    200,
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                     <CopyObjectResult><ETag>\"etag\"</ETag>\
                     <LastModified>2022-01-01T00:00:00.000Z</LastModified>\
                     </CopyObjectResult>"
                        .to_string(),
                )
            }
            None => error(404, "NoSuchKey", "The specified key does not exist."),
        }
    }

    fn upload_part(
        &mut self,
        key: &str,
        upload_id: &str,
        part_number: &str,
        content: Vec<u8>,
    ) -> HttpResponse {
        self.requests.push(format!("UPLOAD_PART {}", key));

        if self.failing.contains(&Operation::UploadPart) {
            return error(403, "AccessDenied", "Access Denied");
        }

        match (self.uploads.get_mut(upload_id), part_number.parse()) {
            (Some(upload), Ok(part_number)) => {
                upload.parts.insert(part_number, content);

                with_etag(response(200, SdkBody::empty()))
            }
            _ => error(404, "NoSuchUpload", "The upload does not exist"),
        }
    }
}

impl HttpConnector for FakeS3 {
    fn call(&self, mut request: HttpRequest) -> HttpConnectorFuture {
        let fake = self.clone();

        HttpConnectorFuture::new(async move {
            let data = ByteStream::new(request.take_body())
                .collect()
                .await
                .map(|data| data.into_bytes().to_vec())
                .unwrap_or_default();
            let body = decode_body(&request, data);

            Ok(fake.handle(&request, body))
        })
    }
}

impl HttpClient for FakeS3 {
    fn http_connector(
        &self,
        _settings: &HttpConnectorSettings,
        _components: &RuntimeComponents,
    ) -> SharedHttpConnector {
        SharedHttpConnector::new(self.clone())
    }
}

fn response(status: u16, body: SdkBody) -> HttpResponse {
    HttpResponse::new(StatusCode::try_from(status).unwrap(), body)
}

fn xml(status: u16, body: String) -> HttpResponse {
    let mut response = response(status, SdkBody::from(body));
    response
        .headers_mut()
        .insert("content-type", "application/xml");

    response
}

fn error(status: u16, code: &str, message: &str) -> HttpResponse {
    xml(
        status,
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>{}</Code><Message>{}</Message><RequestId>fake</RequestId></Error>",
            code, message
        ),
    )
}

fn with_etag(mut response: HttpResponse) -> HttpResponse {
    response.headers_mut().insert("etag", "\"etag\"");

    response
}

/// Undoes the `aws-chunked` encoding the SDK may apply to payloads.
fn decode_body(request: &HttpRequest, data: Vec<u8>) -> Vec<u8> {
    let chunked = request
        .headers()
        .get("content-encoding")
        .map_or(false, |encoding| encoding.contains("aws-chunked"));

    if chunked {
        decode_aws_chunked(&data)
    } else {
        data
    }
}

fn decode_aws_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut content = Vec::new();

    while let Some(line_end) = data.windows(2).position(|window| window == b"\r\n") {
        let header = std::str::from_utf8(&data[..line_end]).unwrap_or_default();
        let size = header
            .split(';')
            .next()
            .and_then(|size| usize::from_str_radix(size.trim(), 16).ok())
            .unwrap_or_default();

        if size == 0 {
            break;
        }

        let start = line_end + 2;
        content.extend_from_slice(&data[start..start + size]);
        data = &data[(start + size + 2).min(data.len())..];
    }

    content
}

fn split_uri(uri: &str) -> (&str, &str) {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let path_and_query = rest.find('/').map_or("/", |index| &rest[index..]);

    path_and_query.split_once('?').unwrap_or((path_and_query, ""))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));

            (percent_decode(name), percent_decode(value))
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let byte = std::str::from_utf8(&bytes[index + 1..index + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());

            if let Some(byte) = byte {
                decoded.push(byte);
                index += 3;
                continue;
            }
        }

        decoded.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parsing() {
        let (path, query) = split_uri("http://s3.test/bucket/tmp%2Fkey?x-id=GetObject");

        assert_eq!(path, "/bucket/tmp%2Fkey");
        assert_eq!(percent_decode(path), "/bucket/tmp/key");
        assert_eq!(parse_query(query)["x-id"], "GetObject");
        assert_eq!(split_uri("http://s3.test"), ("/", ""));
    }

    #[test]
    fn test_decode_aws_chunked() {
        assert_eq!(
            decode_aws_chunked(b"5\r\nhello\r\n6\r\n world\r\n0\r\nx-amz-checksum-crc32:AAAA\r\n\r\n"),
            b"hello world"
        );
    }
}
