use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::info;
use uuid::Uuid;

use api_types::{Category, CreateCategoryRequest, UpdateCategoryRequest};
use utils::text::{is_valid_slug, slugify};

use super::{
    auth::AuthService,
    backend::{Backend, BackendError, Filter, Query, Returning},
    error::{BlogError, remote},
    retry::{RetryPolicy, with_retry},
};

pub const CATEGORIES_TABLE: &str = "categories";
pub const DEFAULT_CATEGORY_COLOR: &str = "#6366f1";

static HEX_COLOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").expect("hex color pattern is valid")
});

fn validate_slug(slug: &str) -> Result<(), BlogError> {
    if is_valid_slug(slug) {
        return Ok(());
    }
    let message = "Slug may only contain lowercase letters, numbers and hyphens";
    match slugify(slug) {
        suggestion if suggestion.is_empty() => Err(BlogError::validation(message)),
        suggestion => Err(BlogError::validation(format!(
            "{message} (try \"{suggestion}\")"
        ))),
    }
}

fn validate_color(color: &str) -> Result<(), BlogError> {
    if HEX_COLOR.is_match(color) {
        Ok(())
    } else {
        Err(BlogError::validation(
            "Color must be a hex value like #6366f1",
        ))
    }
}

/// A taken slug is the caller's mistake, not a remote failure.
fn duplicate_slug(context: &str) -> impl FnOnce(BackendError) -> BlogError + '_ {
    move |e| match e {
        BackendError::Conflict(_) => {
            BlogError::validation("A category with this slug already exists")
        }
        other => remote(context)(other),
    }
}

fn parse_category(row: Value, context: &str) -> Result<Category, BlogError> {
    serde_json::from_value(row).map_err(|e| remote(context)(BackendError::from(e)))
}

/// Category CRUD. Reads are public and uncached; writes need the admin session.
#[derive(Clone)]
pub struct CategoryService {
    backend: Arc<dyn Backend>,
    auth: AuthService,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CategoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryService").finish_non_exhaustive()
    }
}

impl CategoryService {
    pub fn new(backend: Arc<dyn Backend>, auth: AuthService, retry: RetryPolicy) -> Self {
        Self {
            backend,
            auth,
            retry,
        }
    }

    /// All categories by name.
    pub async fn list(&self) -> Result<Vec<Category>, BlogError> {
        let query = Query::new().order_asc("name");
        let selection = with_retry(&self.retry, "categories.select", || {
            self.backend.select(CATEGORIES_TABLE, &query, None)
        })
        .await
        .map_err(remote("Failed to load categories"))?;
        selection
            .rows
            .into_iter()
            .map(|row| parse_category(row, "Failed to load categories"))
            .collect()
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Category, BlogError> {
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(BlogError::validation("Slug is required"));
        }
        let query = Query::new().eq("slug", slug).limit(1);
        let selection = with_retry(&self.retry, "categories.get", || {
            self.backend.select(CATEGORIES_TABLE, &query, None)
        })
        .await
        .map_err(remote("Failed to load category"))?;
        let row = selection
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| BlogError::NotFound(format!("Category '{slug}' not found")))?;
        parse_category(row, "Failed to load category")
    }

    pub async fn create(&self, request: CreateCategoryRequest) -> Result<Category, BlogError> {
        let name = request.name.trim();
        let slug = request.slug.trim();
        if name.is_empty() {
            return Err(BlogError::validation("Name is required"));
        }
        if slug.is_empty() {
            return Err(BlogError::validation("Slug is required"));
        }
        validate_slug(slug)?;
        let color = request
            .color
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CATEGORY_COLOR);
        validate_color(color)?;

        let session = self.auth.require_session().await?;
        let token = session.access_token.as_str();

        let row = json!({ "name": name, "slug": slug, "color": color });
        let inserted = with_retry(&self.retry, "categories.insert", || {
            self.backend.insert(
                CATEGORIES_TABLE,
                row.clone(),
                Returning::Representation,
                Some(token),
            )
        })
        .await
        .map_err(duplicate_slug("Failed to create category"))?;

        let category = parse_category(inserted, "Failed to create category")?;
        info!(category_id = %category.id, slug = %category.slug, "Created category");
        Ok(category)
    }

    pub async fn update(
        &self,
        id: Uuid,
        request: UpdateCategoryRequest,
    ) -> Result<Category, BlogError> {
        if id.is_nil() {
            return Err(BlogError::validation("Category id is required"));
        }
        if request.is_empty() {
            return Err(BlogError::validation("Nothing to update"));
        }

        let mut patch = Map::new();
        if let Some(name) = &request.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(BlogError::validation("Name is required"));
            }
            patch.insert("name".into(), json!(name));
        }
        if let Some(slug) = &request.slug {
            let slug = slug.trim();
            if slug.is_empty() {
                return Err(BlogError::validation("Slug is required"));
            }
            validate_slug(slug)?;
            patch.insert("slug".into(), json!(slug));
        }
        if let Some(color) = &request.color {
            let color = color.trim();
            validate_color(color)?;
            patch.insert("color".into(), json!(color));
        }

        let session = self.auth.require_session().await?;
        let token = session.access_token.as_str();

        let filters = [Filter::eq("id", id)];
        let patch = Value::Object(patch);
        let rows = with_retry(&self.retry, "categories.update", || {
            self.backend.update(
                CATEGORIES_TABLE,
                &filters,
                patch.clone(),
                Returning::Representation,
                Some(token),
            )
        })
        .await
        .map_err(duplicate_slug("Failed to update category"))?;

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| BlogError::NotFound(format!("Category {id} not found")))?;
        let category = parse_category(row, "Failed to update category")?;
        info!(category_id = %id, "Updated category");
        Ok(category)
    }

    /// Removes the category. Posts keep any reference to its id.
    pub async fn delete(&self, id: Uuid) -> Result<(), BlogError> {
        if id.is_nil() {
            return Err(BlogError::validation("Category id is required"));
        }
        let session = self.auth.require_session().await?;
        let token = session.access_token.as_str();

        let filters = [Filter::eq("id", id)];
        let removed = with_retry(&self.retry, "categories.delete", || {
            self.backend.delete(
                CATEGORIES_TABLE,
                &filters,
                Returning::Representation,
                Some(token),
            )
        })
        .await
        .map_err(remote("Failed to delete category"))?;
        if removed.is_empty() {
            return Err(BlogError::NotFound(format!("Category {id} not found")));
        }

        info!(category_id = %id, "Deleted category");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::{MemoryBackend, Operation};

    async fn service() -> (Arc<MemoryBackend>, CategoryService) {
        let backend = Arc::new(MemoryBackend::new().with_admin("admin@example.com", "pw"));
        let auth = AuthService::new(backend.clone(), RetryPolicy::none());
        auth.login("admin@example.com", "pw").await.unwrap();
        let categories = CategoryService::new(backend.clone(), auth, RetryPolicy::none());
        (backend, categories)
    }

    fn request(name: &str, slug: &str) -> CreateCategoryRequest {
        CreateCategoryRequest {
            name: name.into(),
            slug: slug.into(),
            color: None,
        }
    }

    #[tokio::test]
    async fn lists_by_name_with_default_color() {
        let (_, categories) = service().await;
        for (name, slug) in [("Travel", "travel"), ("food", "food"), ("Art", "art")] {
            categories.create(request(name, slug)).await.unwrap();
        }

        let listed = categories.list().await.unwrap();
        let names: Vec<_> = listed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Art", "food", "Travel"]);
        assert!(listed.iter().all(|c| c.color == DEFAULT_CATEGORY_COLOR));

        let travel = categories.get_by_slug("travel").await.unwrap();
        assert_eq!(travel.name, "Travel");
    }

    #[tokio::test]
    async fn rejects_invalid_input_locally() {
        let (backend, categories) = service().await;
        backend.reset_calls();

        for bad in [
            request(" ", "slug"),
            request("Name", ""),
            request("Name", "Not A Slug"),
            CreateCategoryRequest {
                color: Some("purple".into()),
                ..request("Name", "name")
            },
        ] {
            assert!(matches!(
                categories.create(bad).await,
                Err(BlogError::Validation(_))
            ));
        }
        assert!(matches!(
            categories
                .update(Uuid::new_v4(), UpdateCategoryRequest::default())
                .await,
            Err(BlogError::Validation(_))
        ));
        assert!(matches!(
            categories.delete(Uuid::nil()).await,
            Err(BlogError::Validation(_))
        ));
        assert_eq!(backend.calls(Operation::Insert), 0);
        assert_eq!(backend.calls(Operation::Update), 0);
    }

    #[test]
    fn invalid_slug_suggests_a_fix() {
        let err = validate_slug("Road Trips").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Slug may only contain lowercase letters, numbers and hyphens (try \"road-trips\")"
        );
    }

    #[tokio::test]
    async fn duplicate_slug_is_a_validation_error() {
        let (_, categories) = service().await;
        categories.create(request("Travel", "travel")).await.unwrap();
        let err = categories
            .create(request("Trips", "travel"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "A category with this slug already exists");
    }

    #[tokio::test]
    async fn renaming_to_a_taken_slug_is_a_validation_error() {
        let (_, categories) = service().await;
        categories.create(request("Travel", "travel")).await.unwrap();
        let food = categories.create(request("Food", "food")).await.unwrap();

        let err = categories
            .update(
                food.id,
                UpdateCategoryRequest {
                    slug: Some("travel".into()),
                    ..UpdateCategoryRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "A category with this slug already exists");
        assert_eq!(categories.get_by_slug("food").await.unwrap().id, food.id);

        let same = categories
            .update(
                food.id,
                UpdateCategoryRequest {
                    slug: Some("food".into()),
                    ..UpdateCategoryRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(same.slug, "food");
    }

    #[tokio::test]
    async fn update_changes_only_given_fields() {
        let (_, categories) = service().await;
        let created = categories.create(request("Travel", "travel")).await.unwrap();

        let updated = categories
            .update(
                created.id,
                UpdateCategoryRequest {
                    color: Some("#0f0".into()),
                    ..UpdateCategoryRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.color, "#0f0");
        assert_eq!(updated.name, "Travel");
        assert_eq!(updated.slug, "travel");
    }

    #[tokio::test]
    async fn delete_reports_missing_rows() {
        let (_, categories) = service().await;
        let created = categories.create(request("Travel", "travel")).await.unwrap();

        categories.delete(created.id).await.unwrap();
        assert!(matches!(
            categories.delete(created.id).await,
            Err(BlogError::NotFound(_))
        ));
        assert!(categories.list().await.unwrap().is_empty());
    }
}
