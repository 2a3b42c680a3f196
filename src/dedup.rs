use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::models::{normalize_title, IdentityKey, Paper};
use crate::store::{PaperStore, StoreError};

fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(incoming);
    }
}

/// Merge `incoming` into `existing`.
///
/// Optional scalars keep the first non-empty value, metrics take the maximum and
/// keyword/reference sets are unioned. Nothing already present is removed or reduced.
pub fn merge_into(existing: &mut Paper, incoming: &Paper) {
    fill(&mut existing.doi, &incoming.doi);
    fill(&mut existing.abstract_text, &incoming.abstract_text);
    fill(&mut existing.pdf_url, &incoming.pdf_url);
    fill(&mut existing.open_access_url, &incoming.open_access_url);
    fill(&mut existing.publisher_url, &incoming.publisher_url);
    fill(&mut existing.venue, &incoming.venue);
    fill(&mut existing.volume, &incoming.volume);
    fill(&mut existing.issue, &incoming.issue);
    fill(&mut existing.pages, &incoming.pages);
    fill(&mut existing.publisher, &incoming.publisher);
    fill(&mut existing.year, &incoming.year);
    if existing.publication_date.is_none() {
        if let Some(date) = incoming.publication_date {
            existing.set_publication_date(date);
        }
    }
    if existing.authors.is_empty() {
        existing.authors.clone_from(&incoming.authors);
    }

    for (source, id) in &incoming.external_ids {
        existing.add_external_id(source, id.as_str());
    }

    existing.citation_count = existing.citation_count.max(incoming.citation_count);
    existing.reference_count = existing.reference_count.max(incoming.reference_count);
    existing.influential_citation_count = existing
        .influential_citation_count
        .max(incoming.influential_citation_count);

    existing.keywords.extend(incoming.keywords.iter().cloned());
    for r in &incoming.references {
        existing.add_reference(r.as_str());
    }
    fill(&mut existing.analysis, &incoming.analysis);
}

/// Collapse papers sharing an identity key, in encounter order. The first paper seen
/// under a key is kept and later ones are merged into it.
pub fn dedup_papers(papers: Vec<Paper>) -> Vec<Paper> {
    let mut index: HashMap<IdentityKey, usize> = HashMap::new();
    let mut out: Vec<Paper> = Vec::with_capacity(papers.len());
    for paper in papers {
        match index.get(paper.identity()) {
            Some(&i) => merge_into(&mut out[i], &paper),
            None => {
                index.insert(paper.identity().clone(), out.len());
                out.push(paper);
            }
        }
    }
    out
}

/// Commits fetched papers against the persistent store, one identity at a time.
pub struct Reconciler {
    store: Arc<dyn PaperStore>,
    locks: StdMutex<HashMap<IdentityKey, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PaperStore>) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &IdentityKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &IdentityKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Find the persisted version of `fetched` (by DOI, then by normalized title),
    /// merge the fetched data into it and write it back; insert when nothing matches.
    /// Returns the record as stored.
    ///
    /// A DOI-keyed paper also holds the lock of its title key, since the lookup may fall
    /// through to a title match. Title locks are always taken last.
    pub async fn reconcile(&self, fetched: Paper) -> Result<Paper, StoreError> {
        let mut keys = vec![fetched.identity().clone()];
        if matches!(fetched.identity(), IdentityKey::Doi(_)) {
            let title = normalize_title(&fetched.title);
            if !title.is_empty() {
                keys.push(IdentityKey::Title(title));
            }
        }

        let locks: Vec<Arc<Mutex<()>>> = keys.iter().map(|k| self.lock_for(k)).collect();
        let result = {
            let mut guards = Vec::with_capacity(locks.len());
            for lock in &locks {
                guards.push(lock.lock().await);
            }
            self.reconcile_locked(fetched).await
        };
        drop(locks);
        for key in &keys {
            self.release(key);
        }
        result
    }

    async fn reconcile_locked(&self, fetched: Paper) -> Result<Paper, StoreError> {
        let mut existing = match fetched.doi.as_deref() {
            Some(doi) => self.store.find_by_doi(doi).await?,
            None => None,
        };
        if existing.is_none() {
            existing = self
                .store
                .find_by_title(&fetched.title)
                .await?
                .filter(|candidate| dois_compatible(candidate, &fetched));
        }

        let paper = match existing {
            Some(mut persisted) => {
                merge_into(&mut persisted, &fetched);
                persisted.updated_at = Utc::now();
                tracing::debug!(id = %persisted.id, identity = %persisted.identity(), "Merged into persisted paper");
                persisted
            }
            None => fetched,
        };
        self.store.upsert(&paper).await?;
        Ok(paper)
    }
}

/// Two records with different DOIs are different papers even if their titles agree.
fn dois_compatible(a: &Paper, b: &Paper) -> bool {
    match (a.doi_key(), b.doi_key()) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}
