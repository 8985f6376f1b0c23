use crate::errors::DbError;
use bson::Document;
use serde::{Deserialize, Serialize};

/// A book as stored in the `books` collection. The collection is
/// schema-less; this type only describes the shape the sample data uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    pub author: String,
    pub genre: String,
    pub published_year: i32,
    pub price: f64,
    pub in_stock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

impl Book {
    #[must_use]
    pub fn new(title: &str, author: &str, genre: &str, published_year: i32, price: f64, in_stock: bool) -> Self {
        Self {
            title: title.to_string(),
            author: author.to_string(),
            genre: genre.to_string(),
            published_year,
            price,
            in_stock,
            pages: None,
            publisher: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, pages: i32, publisher: &str) -> Self {
        self.pages = Some(pages);
        self.publisher = Some(publisher.to_string());
        self
    }

    /// # Errors
    /// Returns an error if serialization to BSON fails.
    pub fn to_document(&self) -> Result<Document, DbError> {
        Ok(bson::serialize_to_document(self)?)
    }

    /// # Errors
    /// Returns an error if the document lacks one of the required fields.
    pub fn from_document(doc: Document) -> Result<Self, DbError> {
        Ok(bson::deserialize_from_document(doc)?)
    }
}

/// The twelve books the exercises are written against.
#[must_use]
pub fn sample_books() -> Vec<Book> {
    vec![
        Book::new("To Kill a Mockingbird", "Harper Lee", "Fiction", 1960, 12.99, true)
            .with_details(336, "J. B. Lippincott & Co."),
        Book::new("1984", "George Orwell", "Dystopian", 1949, 10.99, true)
            .with_details(328, "Secker & Warburg"),
        Book::new("The Great Gatsby", "F. Scott Fitzgerald", "Fiction", 1925, 9.99, true)
            .with_details(180, "Charles Scribner's Sons"),
        Book::new("Brave New World", "Aldous Huxley", "Dystopian", 1932, 11.5, false)
            .with_details(311, "Chatto & Windus"),
        Book::new("The Hobbit", "J.R.R. Tolkien", "Fantasy", 1937, 14.99, true)
            .with_details(310, "George Allen & Unwin"),
        Book::new("The Catcher in the Rye", "J.D. Salinger", "Fiction", 1951, 8.99, true)
            .with_details(224, "Little, Brown and Co."),
        Book::new("Pride and Prejudice", "Jane Austen", "Romance", 1813, 7.99, true)
            .with_details(432, "T. Egerton"),
        Book::new("The Lord of the Rings", "J.R.R. Tolkien", "Fantasy", 1954, 19.99, true)
            .with_details(1178, "Allen & Unwin"),
        Book::new("Animal Farm", "George Orwell", "Political Satire", 1945, 8.5, false)
            .with_details(112, "Secker & Warburg"),
        Book::new("The Alchemist", "Paulo Coelho", "Fiction", 1988, 10.99, true)
            .with_details(197, "HarperOne"),
        Book::new("Moby Dick", "Herman Melville", "Adventure", 1851, 12.5, false)
            .with_details(635, "Harper & Brothers"),
        Book::new("Wuthering Heights", "Emily Brontë", "Gothic Fiction", 1847, 9.99, true)
            .with_details(342, "Thomas Cautley Newby"),
    ]
}

/// [`sample_books`] as BSON documents, ready for `insert_many`.
///
/// # Errors
/// Returns an error if any book fails to serialize.
pub fn sample_documents() -> Result<Vec<Document>, DbError> {
    sample_books().iter().map(Book::to_document).collect()
}
