use std::collections::{BTreeMap, HashMap};

use aws_sdk_s3::primitives::{ByteStream, DateTime, DateTimeFormat};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, ServerSideEncryption, Tag, Tagging,
};

use crate::adapters::blocking::block_on_sdk;
use crate::adapters::credentials::DestinationCredential;
use crate::adapters::sdk_errors::replication_error;
use crate::runtime::contract::NULL_VERSION_ID;
use crate::runtime::error::ReplicationError;

pub type ObjectTags = BTreeMap<String, String>;

/// Objects up to this size go up in one PutObject; larger ones, and objects
/// of unknown length, use a multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
pub const MIN_PART_SIZE: u64 = 16 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

/// Metadata carried over from the source object on copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: Option<String>,
    /// Raw `Expires` header (HTTP-date).
    pub expires: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
}

/// Object content, either in memory or an unread response stream.
#[derive(Debug)]
pub enum ObjectBody {
    Bytes(Vec<u8>),
    Stream(ByteStream),
}

impl ObjectBody {
    /// Reads the whole body into memory.
    pub fn into_bytes(self) -> Result<Vec<u8>, ReplicationError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream(stream) => block_on_sdk(stream.collect())
                .map(|data| data.into_bytes().to_vec())
                .map_err(|error| ReplicationError::transient("get_object", error.to_string())),
        }
    }

    fn into_byte_stream(self) -> ByteStream {
        match self {
            Self::Bytes(bytes) => ByteStream::from(bytes),
            Self::Stream(stream) => stream,
        }
    }
}

#[derive(Debug)]
pub struct SourceObject {
    pub body: ObjectBody,
    /// Body length as announced by the source, when known.
    pub content_length: Option<u64>,
    pub metadata: ObjectMetadata,
}

impl SourceObject {
    pub fn needs_multipart(&self) -> bool {
        self.content_length
            .map_or(true, |length| length > MULTIPART_THRESHOLD)
    }
}

/// Part size keeping an upload of `content_length` bytes within the
/// part-count limit.
pub fn part_size(content_length: Option<u64>) -> u64 {
    let needed = content_length.map_or(0, |length| length.div_ceil(MAX_PARTS));
    needed.max(MIN_PART_SIZE)
}

/// Parses the stored `Expires` header; an unparseable value is dropped.
pub fn expires_at(metadata: &ObjectMetadata) -> Option<DateTime> {
    metadata
        .expires
        .as_deref()
        .and_then(|value| DateTime::from_str(value, DateTimeFormat::HttpDate).ok())
}

/// Read access to the watched bucket, using the executing identity.
pub trait SourceObjects {
    fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<SourceObject, ReplicationError>;

    fn fetch_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectTags, ReplicationError>;
}

/// Write access to the destination bucket, bound to one credential.
pub trait DestinationObjects {
    /// Writes a new destination object and returns its version id, if the
    /// destination bucket is versioned.
    fn put_object(
        &self,
        key: &str,
        object: SourceObject,
        tags: &ObjectTags,
    ) -> Result<Option<String>, ReplicationError>;

    fn put_tags(
        &self,
        key: &str,
        version_id: Option<&str>,
        tags: &ObjectTags,
    ) -> Result<(), ReplicationError>;

    fn delete_tags(&self, key: &str, version_id: Option<&str>) -> Result<(), ReplicationError>;

    fn delete_object(&self, key: &str, version_id: Option<&str>) -> Result<(), ReplicationError>;
}

pub trait DestinationConnector {
    fn connect(
        &self,
        credential: &DestinationCredential,
    ) -> Result<Box<dyn DestinationObjects>, ReplicationError>;
}

/// S3 `x-amz-tagging` header value.
pub fn encode_tagging(tags: &ObjectTags) -> Result<Option<String>, ReplicationError> {
    if tags.is_empty() {
        return Ok(None);
    }
    serde_urlencoded::to_string(tags)
        .map(Some)
        .map_err(|error| ReplicationError::malformed(format!("unencodable tag set: {error}")))
}

/// Version id to address on the destination; `$null` marks an object
/// written to an unversioned bucket.
pub fn destination_version(stored: &str) -> Option<&str> {
    (stored != NULL_VERSION_ID).then_some(stored)
}

fn missing_source(key: &str, version_id: Option<&str>) -> ReplicationError {
    ReplicationError::SourceObjectMissing {
        key: key.to_string(),
        version: version_id.unwrap_or(NULL_VERSION_ID).to_string(),
    }
}

fn missing_destination(key: &str) -> ReplicationError {
    ReplicationError::DestinationObjectMissing {
        key: key.to_string(),
    }
}

pub struct S3SourceObjects {
    client: aws_sdk_s3::Client,
}

impl S3SourceObjects {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

impl SourceObjects for S3SourceObjects {
    fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<SourceObject, ReplicationError> {
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string));

        let output = block_on_sdk(request.send())
            .map_err(|error| replication_error("get_object", &error, Some(missing_source(key, version_id))))?;

        let metadata = ObjectMetadata {
            cache_control: output.cache_control().map(str::to_string),
            content_disposition: output.content_disposition().map(str::to_string),
            content_encoding: output.content_encoding().map(str::to_string),
            content_language: output.content_language().map(str::to_string),
            content_type: output.content_type().map(str::to_string),
            expires: output.expires_string().map(str::to_string),
            user_metadata: output
                .metadata()
                .map(|values| values.clone().into_iter().collect())
                .unwrap_or_default(),
        };

        let content_length = output
            .content_length()
            .and_then(|length| u64::try_from(length).ok());

        Ok(SourceObject {
            body: ObjectBody::Stream(output.body),
            content_length,
            metadata,
        })
    }

    fn fetch_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectTags, ReplicationError> {
        let request = self
            .client
            .get_object_tagging()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string));

        let output = block_on_sdk(request.send()).map_err(|error| {
            replication_error(
                "get_object_tagging",
                &error,
                Some(missing_source(key, version_id)),
            )
        })?;

        Ok(output
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }
}

/// Builds destination clients from the per-invocation credential.
pub struct S3DestinationConnector {
    bucket: String,
    region: String,
    kms_key_id: Option<String>,
}

impl S3DestinationConnector {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>, kms_key_id: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            kms_key_id,
        }
    }
}

impl DestinationConnector for S3DestinationConnector {
    fn connect(
        &self,
        credential: &DestinationCredential,
    ) -> Result<Box<dyn DestinationObjects>, ReplicationError> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            credential.access_id.clone(),
            credential.access_secret.clone(),
            None,
            None,
            "partition-replicate-destination",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .build();

        tracing::debug!(
            component = "destination_connector",
            event = "destination_client_built",
            bucket = %self.bucket,
            region = %self.region,
            partition = %credential.partition,
        );

        Ok(Box::new(S3DestinationObjects {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: self.bucket.clone(),
            kms_key_id: self.kms_key_id.clone(),
        }))
    }
}

pub struct S3DestinationObjects {
    client: aws_sdk_s3::Client,
    bucket: String,
    kms_key_id: Option<String>,
}

impl S3DestinationObjects {
    fn user_metadata(metadata: &ObjectMetadata) -> Option<HashMap<String, String>> {
        (!metadata.user_metadata.is_empty())
            .then(|| metadata.user_metadata.clone().into_iter().collect())
    }

    fn put_single(
        &self,
        key: &str,
        object: SourceObject,
        tags: &ObjectTags,
    ) -> Result<Option<String>, ReplicationError> {
        let metadata = &object.metadata;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_cache_control(metadata.cache_control.clone())
            .set_content_disposition(metadata.content_disposition.clone())
            .set_content_encoding(metadata.content_encoding.clone())
            .set_content_language(metadata.content_language.clone())
            .set_content_type(metadata.content_type.clone())
            .set_expires(expires_at(metadata))
            .set_metadata(Self::user_metadata(metadata))
            .set_content_length(object.content_length.and_then(|length| i64::try_from(length).ok()))
            .set_tagging(encode_tagging(tags)?);

        if let Some(kms_key_id) = &self.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key_id);
        }

        let output = block_on_sdk(request.body(object.body.into_byte_stream()).send())
            .map_err(|error| replication_error("put_object", &error, None))?;
        Ok(output.version_id().map(str::to_string))
    }

    fn put_multipart(
        &self,
        key: &str,
        object: SourceObject,
        tags: &ObjectTags,
    ) -> Result<Option<String>, ReplicationError> {
        let metadata = &object.metadata;
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_cache_control(metadata.cache_control.clone())
            .set_content_disposition(metadata.content_disposition.clone())
            .set_content_encoding(metadata.content_encoding.clone())
            .set_content_language(metadata.content_language.clone())
            .set_content_type(metadata.content_type.clone())
            .set_expires(expires_at(metadata))
            .set_metadata(Self::user_metadata(metadata))
            .set_tagging(encode_tagging(tags)?);

        if let Some(kms_key_id) = &self.kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key_id);
        }

        let created = block_on_sdk(request.send())
            .map_err(|error| replication_error("create_multipart_upload", &error, None))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                ReplicationError::transient("create_multipart_upload", "response carried no upload id")
            })?
            .to_string();

        let part_size = part_size(object.content_length);
        let result = self
            .upload_parts(key, &upload_id, object.body, part_size)
            .and_then(|parts| self.complete_upload(key, &upload_id, parts));
        if result.is_err() {
            self.abort_upload(key, &upload_id);
        }
        result
    }

    /// Streams `body` into parts of at least `part_size` bytes; only one
    /// part is held in memory at a time.
    fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: ObjectBody,
        part_size: u64,
    ) -> Result<Vec<CompletedPart>, ReplicationError> {
        let part_size = usize::try_from(part_size).unwrap_or(usize::MAX);
        let mut stream = body.into_byte_stream();
        let mut parts = Vec::new();
        let mut buffer = Vec::new();

        loop {
            let chunk = block_on_sdk(stream.next())
                .transpose()
                .map_err(|error| ReplicationError::transient("get_object", error.to_string()))?;
            let finished = chunk.is_none();
            if let Some(chunk) = chunk {
                buffer.extend_from_slice(&chunk);
            }

            // An empty object still needs one part.
            let last_part = finished && (!buffer.is_empty() || parts.is_empty());
            if buffer.len() >= part_size || last_part {
                let part = self.upload_part(key, upload_id, parts.len() + 1, std::mem::take(&mut buffer))?;
                parts.push(part);
            }
            if finished {
                return Ok(parts);
            }
        }
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: usize,
        data: Vec<u8>,
    ) -> Result<CompletedPart, ReplicationError> {
        let part_number = i32::try_from(number)
            .map_err(|_| ReplicationError::malformed(format!("object {key} needs too many parts")))?;
        let length = i64::try_from(data.len()).unwrap_or(i64::MAX);

        let request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(length)
            .body(ByteStream::from(data));

        let output = block_on_sdk(request.send())
            .map_err(|error| replication_error("upload_part", &error, None))?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(output.e_tag().map(str::to_string))
            .build())
    }

    fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, ReplicationError> {
        let part_count = parts.len();
        let request = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build());

        let output = block_on_sdk(request.send())
            .map_err(|error| replication_error("complete_multipart_upload", &error, None))?;
        tracing::debug!(
            component = "destination_objects",
            event = "multipart_upload_completed",
            key,
            parts = part_count,
        );
        Ok(output.version_id().map(str::to_string))
    }

    fn abort_upload(&self, key: &str, upload_id: &str) {
        let request = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id);

        if let Err(error) = block_on_sdk(request.send()) {
            tracing::warn!(
                component = "destination_objects",
                event = "multipart_abort_failed",
                key,
                upload_id,
                error = %replication_error("abort_multipart_upload", &error, None),
            );
        }
    }
}

impl DestinationObjects for S3DestinationObjects {
    fn put_object(
        &self,
        key: &str,
        object: SourceObject,
        tags: &ObjectTags,
    ) -> Result<Option<String>, ReplicationError> {
        if object.needs_multipart() {
            self.put_multipart(key, object, tags)
        } else {
            self.put_single(key, object, tags)
        }
    }

    fn put_tags(
        &self,
        key: &str,
        version_id: Option<&str>,
        tags: &ObjectTags,
    ) -> Result<(), ReplicationError> {
        let tag_set = tags
            .iter()
            .map(|(name, value)| Tag::builder().key(name).value(value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| ReplicationError::malformed(format!("invalid tag: {error}")))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|error| ReplicationError::malformed(format!("invalid tag set: {error}")))?;

        let request = self
            .client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .tagging(tagging);

        block_on_sdk(request.send())
            .map(|_| ())
            .map_err(|error| replication_error("put_object_tagging", &error, Some(missing_destination(key))))
    }

    fn delete_tags(&self, key: &str, version_id: Option<&str>) -> Result<(), ReplicationError> {
        let request = self
            .client
            .delete_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string));

        block_on_sdk(request.send()).map(|_| ()).map_err(|error| {
            replication_error("delete_object_tagging", &error, Some(missing_destination(key)))
        })
    }

    fn delete_object(&self, key: &str, version_id: Option<&str>) -> Result<(), ReplicationError> {
        let request = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string));

        block_on_sdk(request.send())
            .map(|_| ())
            .map_err(|error| replication_error("delete_object", &error, Some(missing_destination(key))))
    }
}
