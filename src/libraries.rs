use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::api::BookInput;
use crate::error::{AppError, Result};
use crate::models::{Book, BookStatus, Library, User};
use crate::roles::{has_permission, Permission};
use crate::store::{BlobStore, LIBRARIES_KEY};

/// Libraries and the books nested inside them. Persisted as a map keyed
/// by library id, matching the original blob layout.
pub struct LibraryCatalog {
    store: Arc<dyn BlobStore>,
    libraries: RwLock<Vec<Library>>,
}

impl LibraryCatalog {
    pub async fn load(store: Arc<dyn BlobStore>) -> Result<Self> {
        let mut libraries: Vec<Library> = match store.read(LIBRARIES_KEY).await? {
            Some(raw) => {
                let by_id: BTreeMap<String, Library> = serde_json::from_str(&raw)?;
                by_id.into_values().collect()
            }
            None => Vec::new(),
        };
        libraries.sort_by(|a, b| {
            a.creation_date
                .cmp(&b.creation_date)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(LibraryCatalog {
            store,
            libraries: RwLock::new(libraries),
        })
    }

    async fn persist(&self, libraries: &[Library]) -> Result<()> {
        let by_id: BTreeMap<&str, &Library> =
            libraries.iter().map(|l| (l.id.as_str(), l)).collect();
        let raw = serde_json::to_string(&by_id)?;
        self.store.write(LIBRARIES_KEY, &raw).await
    }

    pub async fn list(&self, owner_email: Option<&str>) -> Vec<Library> {
        let libraries = self.libraries.read().await;
        match owner_email {
            Some(email) => libraries
                .iter()
                .filter(|l| l.owner_email.eq_ignore_ascii_case(email))
                .cloned()
                .collect(),
            None => libraries.clone(),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Library> {
        self.libraries
            .read()
            .await
            .iter()
            .find(|l| l.id == id)
            .cloned()
    }

    pub async fn create(&self, actor: &User, name: &str, description: &str) -> Result<Library> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("library name is required".to_string()));
        }

        let library = Library {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            description: description.trim().to_string(),
            owner: actor.name.clone(),
            owner_email: actor.email.clone(),
            book_count: 0,
            creation_date: Utc::now(),
            books: Vec::new(),
        };

        let mut libraries = self.libraries.write().await;
        libraries.push(library.clone());
        self.persist(&libraries).await?;
        Ok(library)
    }

    pub async fn update(
        &self,
        actor: &User,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Library> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("library name is required".to_string()));
        }

        let mut libraries = self.libraries.write().await;
        let library = find_library(&mut libraries, id)?;
        authorize(actor, library)?;

        library.name = name.trim().to_string();
        library.description = description.trim().to_string();
        let updated = library.clone();

        self.persist(&libraries).await?;
        Ok(updated)
    }

    /// Removes the library and its books wholesale; returns the removed
    /// record so the caller can settle the owner's library count.
    pub async fn delete(&self, actor: &User, id: &str) -> Result<Library> {
        let mut libraries = self.libraries.write().await;
        let position = libraries
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| AppError::NotFound(format!("library {id}")))?;
        authorize(actor, &libraries[position])?;

        let removed = libraries.remove(position);
        self.persist(&libraries).await?;
        Ok(removed)
    }

    pub async fn add_book(&self, actor: &User, library_id: &str, input: BookInput) -> Result<Book> {
        validate_book(&input)?;

        let mut libraries = self.libraries.write().await;
        let library = find_library(&mut libraries, library_id)?;
        authorize(actor, library)?;

        let mut book = Book {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            author: String::new(),
            category: String::new(),
            description: String::new(),
            status: BookStatus::Available,
            borrow_date: None,
            volumes: 1,
            is_rare: false,
            is_reference: false,
            needs_repair: false,
        };
        apply_book_input(&mut book, input);

        library.books.push(book.clone());
        library.book_count = library.books.len();

        self.persist(&libraries).await?;
        Ok(book)
    }

    pub async fn update_book(
        &self,
        actor: &User,
        library_id: &str,
        book_id: &str,
        input: BookInput,
    ) -> Result<Book> {
        validate_book(&input)?;

        let mut libraries = self.libraries.write().await;
        let library = find_library(&mut libraries, library_id)?;
        authorize(actor, library)?;

        let book = library
            .books
            .iter_mut()
            .find(|b| b.id == book_id)
            .ok_or_else(|| AppError::NotFound(format!("book {book_id}")))?;
        apply_book_input(book, input);
        let updated = book.clone();

        self.persist(&libraries).await?;
        Ok(updated)
    }

    pub async fn delete_book(&self, actor: &User, library_id: &str, book_id: &str) -> Result<()> {
        let mut libraries = self.libraries.write().await;
        let library = find_library(&mut libraries, library_id)?;
        authorize(actor, library)?;

        let position = library
            .books
            .iter()
            .position(|b| b.id == book_id)
            .ok_or_else(|| AppError::NotFound(format!("book {book_id}")))?;
        library.books.remove(position);
        library.book_count = library.books.len();

        self.persist(&libraries).await
    }

    /// Case-insensitive title/author search inside one library; a blank
    /// query returns every book.
    pub async fn search_books(&self, library_id: &str, query: &str) -> Result<Vec<Book>> {
        let libraries = self.libraries.read().await;
        let library = libraries
            .iter()
            .find(|l| l.id == library_id)
            .ok_or_else(|| AppError::NotFound(format!("library {library_id}")))?;

        let query = query.trim();
        if query.is_empty() {
            return Ok(library.books.clone());
        }

        let needle = query.to_lowercase();
        Ok(library
            .books
            .iter()
            .filter(|b| {
                b.title.to_lowercase().contains(&needle)
                    || b.author.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect())
    }
}

fn find_library<'a>(libraries: &'a mut [Library], id: &str) -> Result<&'a mut Library> {
    libraries
        .iter_mut()
        .find(|l| l.id == id)
        .ok_or_else(|| AppError::NotFound(format!("library {id}")))
}

// Ownership is by email convention; staff with manage_libraries may touch
// any library.
fn authorize(actor: &User, library: &Library) -> Result<()> {
    if actor.email.eq_ignore_ascii_case(&library.owner_email)
        || has_permission(actor.role, Permission::ManageLibraries)
    {
        Ok(())
    } else {
        Err(AppError::PermissionDenied {
            role: actor.role,
            permission: Permission::ManageLibraries,
        })
    }
}

fn validate_book(input: &BookInput) -> Result<()> {
    if input.title.trim().is_empty() || input.author.trim().is_empty() {
        return Err(AppError::Validation(
            "book title and author are required".to_string(),
        ));
    }
    Ok(())
}

fn apply_book_input(book: &mut Book, input: BookInput) {
    book.title = input.title.trim().to_string();
    book.author = input.author.trim().to_string();
    book.category = input.category.trim().to_string();
    book.description = input.description.trim().to_string();
    book.status = input.status.unwrap_or(book.status);
    book.volumes = input.volumes.unwrap_or(book.volumes).max(1);
    book.is_rare = input.is_rare;
    book.is_reference = input.is_reference;
    book.needs_repair = input.needs_repair;

    // borrowDate only carries meaning while the book is out.
    book.borrow_date = if book.status == BookStatus::Borrowed {
        input.borrow_date.or(book.borrow_date).or_else(|| Some(Utc::now()))
    } else {
        None
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, UserStatus};
    use crate::store::MemoryStore;

    fn person(name: &str, email: &str, role: Role) -> User {
        User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.to_string(),
            status: UserStatus::Active,
            role,
            registration_date: Utc::now(),
            library_count: 0,
        }
    }

    fn book_input(title: &str, author: &str) -> BookInput {
        BookInput {
            title: title.to_string(),
            author: author.to_string(),
            category: "Fiction".to_string(),
            description: String::new(),
            status: None,
            borrow_date: None,
            volumes: None,
            is_rare: false,
            is_reference: false,
            needs_repair: false,
        }
    }

    async fn catalog() -> LibraryCatalog {
        LibraryCatalog::load(Arc::new(MemoryStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn owners_manage_their_own_libraries() {
        let catalog = catalog().await;
        let alice = person("Alice", "alice@example.com", Role::User);
        let bob = person("Bob", "bob@example.com", Role::User);

        let library = catalog.create(&alice, "Novels", "fiction shelf").await.unwrap();
        assert_eq!(library.owner_email, "alice@example.com");

        let err = catalog
            .update(&bob, &library.id, "Hijacked", "")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied { .. }));

        let renamed = catalog
            .update(&alice, &library.id, "Paperbacks", "fiction shelf")
            .await
            .unwrap();
        assert_eq!(renamed.name, "Paperbacks");
    }

    #[tokio::test]
    async fn staff_may_manage_any_library() {
        let catalog = catalog().await;
        let alice = person("Alice", "alice@example.com", Role::User);
        let admin = person("Root", "root@example.com", Role::Admin);

        let library = catalog.create(&alice, "Novels", "").await.unwrap();
        catalog
            .add_book(&admin, &library.id, book_input("Dune", "Frank Herbert"))
            .await
            .unwrap();

        let removed = catalog.delete(&admin, &library.id).await.unwrap();
        assert_eq!(removed.book_count, 1);
        assert!(catalog.get(&library.id).await.is_none());
    }

    #[tokio::test]
    async fn book_count_tracks_the_nested_list() {
        let catalog = catalog().await;
        let alice = person("Alice", "alice@example.com", Role::User);
        let library = catalog.create(&alice, "Novels", "").await.unwrap();

        let dune = catalog
            .add_book(&alice, &library.id, book_input("Dune", "Frank Herbert"))
            .await
            .unwrap();
        catalog
            .add_book(&alice, &library.id, book_input("Emma", "Jane Austen"))
            .await
            .unwrap();
        assert_eq!(catalog.get(&library.id).await.unwrap().book_count, 2);

        catalog.delete_book(&alice, &library.id, &dune.id).await.unwrap();
        assert_eq!(catalog.get(&library.id).await.unwrap().book_count, 1);
    }

    #[tokio::test]
    async fn leaving_borrowed_clears_the_borrow_date() {
        let catalog = catalog().await;
        let alice = person("Alice", "alice@example.com", Role::User);
        let library = catalog.create(&alice, "Novels", "").await.unwrap();

        let mut input = book_input("Dune", "Frank Herbert");
        input.status = Some(BookStatus::Borrowed);
        let book = catalog.add_book(&alice, &library.id, input.clone()).await.unwrap();
        assert!(book.borrow_date.is_some());

        input.status = Some(BookStatus::Available);
        let returned = catalog
            .update_book(&alice, &library.id, &book.id, input)
            .await
            .unwrap();
        assert_eq!(returned.borrow_date, None);
    }

    #[tokio::test]
    async fn book_search_is_a_case_insensitive_substring_match() {
        let catalog = catalog().await;
        let alice = person("Alice", "alice@example.com", Role::User);
        let library = catalog.create(&alice, "Novels", "").await.unwrap();
        catalog
            .add_book(&alice, &library.id, book_input("Dune", "Frank Herbert"))
            .await
            .unwrap();
        catalog
            .add_book(&alice, &library.id, book_input("Emma", "Jane Austen"))
            .await
            .unwrap();

        let hits = catalog.search_books(&library.id, "herb").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Dune");

        assert_eq!(catalog.search_books(&library.id, "").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persisted_map_layout_reloads_in_creation_order() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let alice = person("Alice", "alice@example.com", Role::User);
        {
            let catalog = LibraryCatalog::load(store.clone()).await.unwrap();
            catalog.create(&alice, "First", "").await.unwrap();
            catalog.create(&alice, "Second", "").await.unwrap();
        }

        let reloaded = LibraryCatalog::load(store).await.unwrap();
        let names: Vec<String> = reloaded
            .list(None)
            .await
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["First", "Second"]);
    }
}
