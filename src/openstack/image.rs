//! Glance v2 calls: create, upload data, list, retire, fetch and delete
//! images.

use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::control_plane::{ControlPlaneError, Image, ImageQuery, ImageUpload};

use super::{OpenStackClient, check_status, decode_json, transport_error};

/// Image property set on retired images.
const OBSOLETE_PROPERTY: &str = "obsolete";
const JSON_PATCH: &str = "application/openstack-images-v2.1-json-patch";
const PAGE_SIZE: &str = "100";

pub(super) async fn create_image(
    client: &OpenStackClient,
    upload: &ImageUpload,
) -> Result<Image, ControlPlaneError> {
    let (request, url) = client.image(Method::POST, "images");
    let response = request
        .json(&image_body(upload))
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_status(response, "image", &upload.name).await?;
    let created: ImageBody = decode_json(response, &url).await?;
    Ok(created.into_image())
}

pub(super) async fn upload_image_data(
    client: &OpenStackClient,
    id: &str,
    upload: &ImageUpload,
) -> Result<(), ControlPlaneError> {
    let file = tokio::fs::File::open(upload.filename.as_std_path())
        .await
        .map_err(|err| ControlPlaneError::Io {
            path: upload.filename.to_string(),
            message: err.to_string(),
        })?;
    debug!(image_id = %id, file = %upload.filename, "uploading image data");
    let (request, _) = client.image(Method::PUT, &format!("images/{id}/file"));
    let response = request
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(file)
        .send()
        .await
        .map_err(transport_error)?;
    check_status(response, "image", id).await.map(drop)
}

pub(super) async fn list_images(
    client: &OpenStackClient,
    query: &ImageQuery,
) -> Result<Vec<Image>, ControlPlaneError> {
    let mut params = vec![("limit", String::from(PAGE_SIZE))];
    if let Some(name) = &query.name {
        params.push(("name", name.clone()));
    }
    if query.obsolete {
        params.push((OBSOLETE_PROPERTY, String::from("true")));
    }

    let (first, mut url) = client.image(Method::GET, "images");
    let mut request = first.query(&params);
    let mut images = Vec::new();
    loop {
        let response = request.send().await.map_err(transport_error)?;
        let response = check_status(response, "image", "images").await?;
        let page: ImagePage = decode_json(response, &url).await?;
        images.extend(
            page.images
                .into_iter()
                .map(ImageBody::into_image)
                .filter(|image| query.matches(image)),
        );
        let Some(next) = page.next else {
            return Ok(images);
        };
        url = format!("{}{next}", client.image_url);
        request = client.authorised(Method::GET, &url);
    }
}

pub(super) async fn mark_image_obsolete(
    client: &OpenStackClient,
    id: &str,
    name: &str,
) -> Result<Image, ControlPlaneError> {
    let (request, url) = client.image(Method::PATCH, &format!("images/{id}"));
    let response = request
        .header(CONTENT_TYPE, JSON_PATCH)
        .body(obsolete_patch(name).to_string())
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_status(response, "image", id).await?;
    let updated: ImageBody = decode_json(response, &url).await?;
    Ok(updated.into_image())
}

fn obsolete_patch(name: &str) -> Value {
    json!([
        {"op": "replace", "path": "/name", "value": name},
        {"op": "add", "path": format!("/{OBSOLETE_PROPERTY}"), "value": "true"},
    ])
}

fn image_body(upload: &ImageUpload) -> Value {
    let mut body = Map::new();
    for (key, value) in &upload.properties {
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        body.insert(key.clone(), Value::String(rendered));
    }
    body.insert(String::from("name"), json!(upload.name));
    body.insert(String::from("disk_format"), json!(upload.disk_format));
    body.insert(String::from("container_format"), json!(upload.container_format));
    body.insert(String::from("min_disk"), json!(upload.min_disk));
    body.insert(String::from("min_ram"), json!(upload.min_ram));
    body.insert(String::from("protected"), json!(upload.protected));
    body.insert(
        String::from("visibility"),
        json!(if upload.public { "public" } else { "private" }),
    );
    body.insert(String::from("tags"), json!(upload.tags));
    Value::Object(body)
}

pub(super) async fn get_image(
    client: &OpenStackClient,
    id: &str,
) -> Result<Image, ControlPlaneError> {
    let (request, url) = client.image(Method::GET, &format!("images/{id}"));
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response, "image", id).await?;
    let body: ImageBody = decode_json(response, &url).await?;
    Ok(body.into_image())
}

pub(super) async fn delete_image(
    client: &OpenStackClient,
    id: &str,
) -> Result<(), ControlPlaneError> {
    let (request, _) = client.image(Method::DELETE, &format!("images/{id}"));
    let response = request.send().await.map_err(transport_error)?;
    check_status(response, "image", id).await.map(drop)
}

#[derive(Deserialize)]
struct ImagePage {
    #[serde(default)]
    images: Vec<ImageBody>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct ImageBody {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    obsolete: Option<Value>,
}

impl ImageBody {
    fn into_image(self) -> Image {
        let obsolete = match self.obsolete {
            Some(Value::Bool(flag)) => flag,
            Some(Value::String(text)) => text.eq_ignore_ascii_case("true"),
            _ => false,
        };
        Image {
            id: self.id,
            name: self.name.unwrap_or_default(),
            status: self.status,
            obsolete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use camino::Utf8PathBuf;

    #[test]
    fn image_body_flattens_properties_as_strings() {
        let upload = ImageUpload {
            name: String::from("VETTER-1"),
            filename: Utf8PathBuf::from("disk.qcow2"),
            disk_format: String::from("qcow2"),
            container_format: String::from("bare"),
            min_disk: 4,
            min_ram: 512,
            protected: false,
            public: true,
            tags: vec![String::from("ci")],
            properties: BTreeMap::from([
                (String::from("os_distro"), json!("ubuntu")),
                (String::from("hw_disk_bus"), json!("scsi")),
                (String::from("cores"), json!(2)),
            ]),
        };
        let body = image_body(&upload);

        assert_eq!(body["os_distro"], json!("ubuntu"));
        assert_eq!(body["cores"], json!("2"));
        assert_eq!(body["visibility"], json!("public"));
        assert_eq!(body["min_ram"], json!(512));
        assert_eq!(body["tags"], json!(["ci"]));
    }

    #[test]
    fn reserved_keys_win_over_properties() {
        let upload = ImageUpload {
            name: String::from("real"),
            filename: Utf8PathBuf::from("disk.qcow2"),
            disk_format: String::from("raw"),
            container_format: String::from("bare"),
            min_disk: 0,
            min_ram: 0,
            protected: false,
            public: false,
            tags: Vec::new(),
            properties: BTreeMap::from([(String::from("name"), json!("shadow"))]),
        };
        assert_eq!(image_body(&upload)["name"], json!("real"));
    }

    #[test]
    fn obsolete_patch_renames_and_flags() {
        assert_eq!(
            obsolete_patch("Obsolete xenial"),
            json!([
                {"op": "replace", "path": "/name", "value": "Obsolete xenial"},
                {"op": "add", "path": "/obsolete", "value": "true"},
            ])
        );
    }

    #[test]
    fn listing_page_reads_the_obsolete_flag_and_next_link() {
        let page: ImagePage = serde_json::from_str(
            r#"{
                "images": [
                    {"id": "a", "name": "Obsolete xenial", "status": "active", "obsolete": "True"},
                    {"id": "b", "name": "xenial", "status": "active"}
                ],
                "next": "/v2/images?marker=b"
            }"#,
        )
        .unwrap_or_else(|err| panic!("parse: {err}"));

        assert_eq!(page.next.as_deref(), Some("/v2/images?marker=b"));
        let flags: Vec<bool> = page
            .images
            .into_iter()
            .map(|body| body.into_image().obsolete)
            .collect();
        assert_eq!(flags, vec![true, false]);
    }
}
