//! In-memory remote store with switchable failures, shared by the unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{Photo, Product, ProductField, ProductRef};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};

const PUBLIC_PREFIX: &str = "https://fake.test/storage/photos/";

pub(crate) fn item(code: &str) -> ProductRef {
    ProductRef::new(code).unwrap()
}

pub(crate) fn product(id: i64, code: &str) -> Product {
    Product {
        id,
        item_code: item(code),
        viet_name: Some(format!("San pham {code}")),
        uom: Some("kg".to_string()),
        weight: None,
        photos: vec![],
    }
}

#[derive(Default)]
struct FakeState {
    products: BTreeMap<ProductRef, Product>,
    photos: BTreeMap<i64, Photo>,
    next_photo_id: i64,
    blobs: BTreeMap<String, Vec<u8>>,
    field_writes: Vec<(ProductRef, Option<f64>)>,
    fail_uploads_for: HashSet<ProductRef>,
    fail_fields_for: HashSet<ProductRef>,
    fail_fetch: bool,
    fail_resolve: bool,
    fail_cleanup: bool,
    unreachable: bool,
    in_flight: usize,
    max_in_flight: usize,
    call_delay: Option<Duration>,
    calls: Vec<&'static str>,
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub(crate) fn with_products(codes: &[&str]) -> Self {
        let remote = Self::default();
        {
            let mut state = remote.state.lock().unwrap();
            state.next_photo_id = 1;
            for (i, code) in codes.iter().enumerate() {
                let p = product(i as i64 + 1, code);
                state.products.insert(p.item_code.clone(), p);
            }
        }
        remote
    }

    /// Seed an existing photo (with its blob) and return its id.
    pub(crate) fn seed_photo(&self, code: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_photo_id += 1;
        let id = state.next_photo_id;
        let path = format!("public/{code}_seed{id}.jpg");
        state.blobs.insert(path.clone(), vec![1, 2, 3]);
        state.photos.insert(
            id,
            Photo {
                id,
                item_code: item(code),
                image_url: format!("{PUBLIC_PREFIX}{path}"),
                created_at: "2024-06-15T10:00:00Z".to_string(),
            },
        );
        id
    }

    pub(crate) fn fail_uploads_for(&self, code: &str) {
        self.state.lock().unwrap().fail_uploads_for.insert(item(code));
    }

    pub(crate) fn clear_upload_failures(&self) {
        self.state.lock().unwrap().fail_uploads_for.clear();
    }

    pub(crate) fn fail_fields_for(&self, code: &str) {
        self.state.lock().unwrap().fail_fields_for.insert(item(code));
    }

    pub(crate) fn fail_fetch(&self, fail: bool) {
        self.state.lock().unwrap().fail_fetch = fail;
    }

    pub(crate) fn fail_resolve(&self, fail: bool) {
        self.state.lock().unwrap().fail_resolve = fail;
    }

    pub(crate) fn fail_cleanup(&self, fail: bool) {
        self.state.lock().unwrap().fail_cleanup = fail;
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub(crate) fn set_call_delay(&self, delay: Duration) {
        self.state.lock().unwrap().call_delay = Some(delay);
    }

    pub(crate) fn weight_of(&self, code: &str) -> Option<f64> {
        self.state.lock().unwrap().products[&item(code)].weight
    }

    pub(crate) fn field_writes(&self) -> usize {
        self.state.lock().unwrap().field_writes.len()
    }

    pub(crate) fn photos_of(&self, code: &str) -> Vec<Photo> {
        let code = item(code);
        self.state
            .lock()
            .unwrap()
            .photos
            .values()
            .filter(|p| p.item_code == code)
            .cloned()
            .collect()
    }

    pub(crate) fn has_photo(&self, id: i64) -> bool {
        self.state.lock().unwrap().photos.contains_key(&id)
    }

    pub(crate) fn blob_count(&self) -> usize {
        self.state.lock().unwrap().blobs.len()
    }

    pub(crate) fn has_blob_for(&self, url: &str) -> bool {
        let path = url.strip_prefix(PUBLIC_PREFIX).unwrap_or(url);
        self.state.lock().unwrap().blobs.contains_key(path)
    }

    /// Names of the remote calls made so far, in the order they started.
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    async fn enter(&self, call: &'static str) -> RemoteResult<()> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            if state.unreachable {
                return Err(RemoteError::transport("connection refused"));
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.call_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().in_flight -= 1;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn update_field(
        &self,
        item_code: &ProductRef,
        field: ProductField,
        value: Option<f64>,
    ) -> RemoteResult<()> {
        self.enter("update_field").await?;
        let mut state = self.state.lock().unwrap();
        if state.fail_fields_for.contains(item_code) {
            return Err(RemoteError::api(500, "update rejected"));
        }
        let Some(product) = state.products.get_mut(item_code) else {
            return Err(RemoteError::api(404, format!("no product {item_code}")));
        };
        match field {
            ProductField::Weight => product.weight = value,
        }
        state.field_writes.push((item_code.clone(), value));
        Ok(())
    }

    async fn upload_blob(&self, path: &str, bytes: Vec<u8>, _mime: &str) -> RemoteResult<()> {
        self.enter("upload_blob").await?;
        let mut state = self.state.lock().unwrap();
        if state
            .fail_uploads_for
            .iter()
            .any(|code| path.starts_with(&format!("public/{code}_")))
        {
            return Err(RemoteError::api(500, "upload failed"));
        }
        if state.blobs.contains_key(path) {
            return Err(RemoteError::api(409, "The resource already exists"));
        }
        state.blobs.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn resolve_public_ref(&self, path: &str) -> RemoteResult<String> {
        self.enter("resolve_public_ref").await?;
        let state = self.state.lock().unwrap();
        if state.fail_resolve || !state.blobs.contains_key(path) {
            return Err(RemoteError::MissingReference(path.to_string()));
        }
        Ok(format!("{PUBLIC_PREFIX}{path}"))
    }

    async fn insert_photo_record(
        &self,
        item_code: &ProductRef,
        image_url: &str,
    ) -> RemoteResult<Photo> {
        self.enter("insert_photo_record").await?;
        let mut state = self.state.lock().unwrap();
        state.next_photo_id += 1;
        let photo = Photo {
            id: state.next_photo_id,
            item_code: item_code.clone(),
            image_url: image_url.to_string(),
            created_at: "2024-06-16T08:00:00Z".to_string(),
        };
        state.photos.insert(photo.id, photo.clone());
        Ok(photo)
    }

    async fn get_photo(&self, photo_id: i64) -> RemoteResult<Option<Photo>> {
        self.enter("get_photo").await?;
        Ok(self.state.lock().unwrap().photos.get(&photo_id).cloned())
    }

    async fn delete_photo_record(&self, photo_id: i64) -> RemoteResult<()> {
        self.enter("delete_photo_record").await?;
        let mut state = self.state.lock().unwrap();
        if state.fail_cleanup {
            return Err(RemoteError::api(500, "delete failed"));
        }
        state.photos.remove(&photo_id);
        Ok(())
    }

    async fn delete_blob(&self, path: &str) -> RemoteResult<()> {
        self.enter("delete_blob").await?;
        let mut state = self.state.lock().unwrap();
        if state.fail_cleanup {
            return Err(RemoteError::api(500, "delete failed"));
        }
        state.blobs.remove(path);
        Ok(())
    }

    fn blob_path_of(&self, reference: &str) -> Option<String> {
        reference.strip_prefix(PUBLIC_PREFIX).map(str::to_string)
    }

    async fn fetch_all(&self) -> RemoteResult<Vec<Product>> {
        self.enter("fetch_all").await?;
        let state = self.state.lock().unwrap();
        if state.fail_fetch {
            return Err(RemoteError::api(503, "service unavailable"));
        }
        Ok(state
            .products
            .values()
            .map(|p| {
                let mut p = p.clone();
                p.photos = state
                    .photos
                    .values()
                    .filter(|ph| ph.item_code == p.item_code)
                    .cloned()
                    .collect();
                p
            })
            .collect())
    }
}
