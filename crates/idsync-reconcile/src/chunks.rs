//! Paged iteration over store selects.
//!
//! [`ContentChunks`] and [`WorkingChunks`] issue one select per page and
//! advance a cursor to the last id returned. [`Rows`] flattens pages into
//! single rows and [`Ids`] maps rows to their ids. A store error ends the
//! stream after being yielded once.

use idsync_types::{
    ContentQuery, ContentRow, ContentTransaction, WorkingQuery, WorkingRow,
};

use crate::error::ReconcileError;

/// Pages of content rows matching a query.
pub struct ContentChunks<'t, T: ?Sized> {
    txn: &'t T,
    kind: &'static str,
    query: ContentQuery,
    cursor: Option<String>,
    done: bool,
}

impl<'t, T: ContentTransaction + ?Sized> ContentChunks<'t, T> {
    pub fn new(txn: &'t T, kind: &'static str, query: ContentQuery) -> Self {
        Self {
            txn,
            kind,
            query,
            cursor: None,
            done: false,
        }
    }
}

impl<T: ContentTransaction + ?Sized> Iterator for ContentChunks<'_, T> {
    type Item = Result<Vec<ContentRow>, ReconcileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let page = self
            .txn
            .select_content(self.kind, &self.query, self.cursor.as_deref());
        advance(page, self.query.chunk_size, &mut self.cursor, &mut self.done, |r| {
            r.id.clone()
        })
    }
}

/// Pages of working rows matching a query.
pub struct WorkingChunks<'t, T: ?Sized> {
    txn: &'t T,
    kind: &'static str,
    query: WorkingQuery,
    cursor: Option<String>,
    done: bool,
}

impl<'t, T: ContentTransaction + ?Sized> WorkingChunks<'t, T> {
    pub fn new(txn: &'t T, kind: &'static str, query: WorkingQuery) -> Self {
        Self {
            txn,
            kind,
            query,
            cursor: None,
            done: false,
        }
    }
}

impl<T: ContentTransaction + ?Sized> Iterator for WorkingChunks<'_, T> {
    type Item = Result<Vec<WorkingRow>, ReconcileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let page = self
            .txn
            .select_working(self.kind, &self.query, self.cursor.as_deref());
        advance(page, self.query.chunk_size, &mut self.cursor, &mut self.done, |r| {
            r.id.clone()
        })
    }
}

fn advance<R>(
    page: Result<Vec<R>, idsync_types::StoreError>,
    chunk_size: usize,
    cursor: &mut Option<String>,
    done: &mut bool,
    id_of: impl Fn(&R) -> String,
) -> Option<Result<Vec<R>, ReconcileError>> {
    match page {
        Ok(rows) => {
            // A short page means the scan reached the end.
            if rows.len() < chunk_size {
                *done = true;
            }
            let last = rows.last()?;
            *cursor = Some(id_of(last));
            Some(Ok(rows))
        }
        Err(e) => {
            *done = true;
            Some(Err(e.into()))
        }
    }
}

/// Single rows out of a page stream.
pub struct Rows<I, R> {
    chunks: I,
    current: std::vec::IntoIter<R>,
}

impl<I, R> Rows<I, R> {
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            current: Vec::new().into_iter(),
        }
    }
}

impl<I, R> Iterator for Rows<I, R>
where
    I: Iterator<Item = Result<Vec<R>, ReconcileError>>,
{
    type Item = Result<R, ReconcileError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.current.next() {
                return Some(Ok(row));
            }
            match self.chunks.next()? {
                Ok(page) => self.current = page.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Rows that can be reduced to their id.
pub trait Identified {
    fn into_id(self) -> String;
}

impl Identified for ContentRow {
    fn into_id(self) -> String {
        self.id
    }
}

impl Identified for WorkingRow {
    fn into_id(self) -> String {
        self.id
    }
}

/// Ids out of a row stream.
pub struct Ids<I>(pub(crate) I);

impl<I, R> Iterator for Ids<I>
where
    I: Iterator<Item = Result<R, ReconcileError>>,
    R: Identified,
{
    type Item = Result<String, ReconcileError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|r| r.map(Identified::into_id))
    }
}
