use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use fieldsync_core::connectivity::ReachabilityProbe;
use fieldsync_core::models::{Photo, Product, ProductField, ProductRef};
use fieldsync_core::remote::{RemoteError, RemoteResult, RemoteStore};

const BUCKET: &str = "photos";
const PRODUCTS_TABLE: &str = "products";
const PHOTOS_TABLE: &str = "product_photos";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn user_agent() -> String {
    format!("fieldsync-cli/{}", env!("CARGO_PKG_VERSION"))
}

/// PostgREST + storage client for the hosted product database.
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseStore {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{BUCKET}/{path}", self.base_url)
    }

    fn public_prefix(&self) -> String {
        format!("{}/storage/v1/object/public/{BUCKET}/", self.base_url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
    }

    async fn send(&self, req: RequestBuilder) -> RemoteResult<Response> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| RemoteError::transport(e.to_string()))?;
        check_status(resp).await
    }

    async fn rows<T: DeserializeOwned>(&self, req: RequestBuilder) -> RemoteResult<Vec<T>> {
        self.send(req)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

async fn check_status(resp: Response) -> RemoteResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::api(status.as_u16(), error_message(status, &body)))
}

/// Pull the human-readable message out of a PostgREST or storage error body.
fn error_message(status: StatusCode, body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .filter(|m| !m.is_empty())
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

fn field_column(field: ProductField) -> &'static str {
    match field {
        ProductField::Weight => "weight",
    }
}

/// Attach each photo to its product, keeping the remote's photo order.
fn attach_photos(mut products: Vec<Product>, photos: Vec<Photo>) -> Vec<Product> {
    for photo in photos {
        if let Some(p) = products.iter_mut().find(|p| p.item_code == photo.item_code) {
            p.photos.push(photo);
        }
    }
    products
}

#[async_trait]
impl RemoteStore for SupabaseStore {
    async fn update_field(
        &self,
        item_code: &ProductRef,
        field: ProductField,
        value: Option<f64>,
    ) -> RemoteResult<()> {
        let req = self
            .client
            .patch(self.rest_url(PRODUCTS_TABLE))
            .query(&[("item_code", format!("eq.{item_code}"))])
            .header("Prefer", "return=representation")
            .json(&json!({ (field_column(field)): value }));
        let updated: Vec<serde_json::Value> = self.rows(req).await?;
        if updated.is_empty() {
            return Err(RemoteError::api(
                StatusCode::NOT_FOUND.as_u16(),
                format!("No product with item code {item_code}"),
            ));
        }
        Ok(())
    }

    async fn upload_blob(&self, path: &str, bytes: Vec<u8>, mime: &str) -> RemoteResult<()> {
        let req = self
            .client
            .post(self.object_url(path))
            .header(reqwest::header::CONTENT_TYPE, mime)
            .header("x-upsert", "false")
            .body(bytes);
        self.send(req).await?;
        Ok(())
    }

    async fn resolve_public_ref(&self, path: &str) -> RemoteResult<String> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(RemoteError::MissingReference(path.to_string()));
        }
        Ok(format!("{}{path}", self.public_prefix()))
    }

    async fn insert_photo_record(
        &self,
        item_code: &ProductRef,
        image_url: &str,
    ) -> RemoteResult<Photo> {
        let req = self
            .client
            .post(self.rest_url(PHOTOS_TABLE))
            .header("Prefer", "return=representation")
            .json(&json!([{ "item_code": item_code, "image_url": image_url }]));
        let inserted: Vec<Photo> = self.rows(req).await?;
        inserted
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse("insert returned no row".to_string()))
    }

    async fn get_photo(&self, photo_id: i64) -> RemoteResult<Option<Photo>> {
        let req = self
            .client
            .get(self.rest_url(PHOTOS_TABLE))
            .query(&[("id", format!("eq.{photo_id}")), ("select", "*".to_string())]);
        let found: Vec<Photo> = self.rows(req).await?;
        Ok(found.into_iter().next())
    }

    async fn delete_photo_record(&self, photo_id: i64) -> RemoteResult<()> {
        let req = self
            .client
            .delete(self.rest_url(PHOTOS_TABLE))
            .query(&[("id", format!("eq.{photo_id}"))]);
        self.send(req).await?;
        Ok(())
    }

    async fn delete_blob(&self, path: &str) -> RemoteResult<()> {
        self.send(self.client.delete(self.object_url(path))).await?;
        Ok(())
    }

    fn blob_path_of(&self, reference: &str) -> Option<String> {
        reference
            .strip_prefix(&self.public_prefix())
            .map(|p| p.split('?').next().unwrap_or(p).to_string())
            .filter(|p| !p.is_empty())
    }

    async fn fetch_all(&self) -> RemoteResult<Vec<Product>> {
        let products: Vec<Product> = self
            .rows(
                self.client
                    .get(self.rest_url(PRODUCTS_TABLE))
                    .query(&[
                        ("select", "id,item_code,viet_name,uom,weight"),
                        ("order", "created_at.desc"),
                    ]),
            )
            .await?;
        let photos: Vec<Photo> = self
            .rows(
                self.client
                    .get(self.rest_url(PHOTOS_TABLE))
                    .query(&[
                        ("select", "id,item_code,image_url,created_at"),
                        ("order", "created_at.asc"),
                    ]),
            )
            .await?;
        Ok(attach_photos(products, photos))
    }
}

/// Reachability by a short HEAD against the remote. Any answer, even an
/// error status, counts as reachable.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "reachability probe failed");
                false
            }
        }
    }
}
