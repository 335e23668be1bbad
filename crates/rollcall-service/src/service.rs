use crate::config::Config;
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use chrono::{NaiveDate, Utc};
use rollcall_core::extractor::{photo_digest, probe_photo, PhotoInfo};
use rollcall_core::types::SignatureDefect;
use rollcall_core::{
    reconcile, AmbiguousFace, DailyToken, DaySummary, ExportRow, ExtractError, FaceExtractor,
    FaceObservation, FaceRegion, MarkOutcome, MarkRequest, NewPerson, Person, PersonRef,
    PhotoLog, Signature, SignatureMatcher,
};
use rollcall_store::{NewPhotoLog, Store, StoreError};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Processed group photos, by date, under the photo directory.
const GROUP_DIR: &str = "groups";
/// New reference photos are written here before being swapped in.
const STAGING_DIR: &str = ".staging";

/// Why an enrollment photo was refused. The person is not created.
#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("at least one enrollment photo is required")]
    NoPhotos,
    #[error("photo {photo} is not a readable image: {source}")]
    Unreadable { photo: usize, source: ExtractError },
    #[error("no face detected in photo {photo}")]
    NoFace { photo: usize },
    #[error("photo {photo} produced an unusable signature: {defect}")]
    Malformed { photo: usize, defect: SignatureDefect },
    #[error("extraction failed for photo {photo}: {source}")]
    Extraction { photo: usize, source: EngineError },
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("enrollment rejected: {0}")]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("photo storage: {0}")]
    Io(#[from] std::io::Error),
}

/// One student marked present by the automatic pass.
#[derive(Debug, Clone, Serialize)]
pub struct AutoMark {
    pub person: PersonRef,
    pub score: f32,
    /// Index of the face within the photo.
    pub face: usize,
    pub region: FaceRegion,
    /// Whether this photo created the entry or it already existed today.
    pub outcome: MarkOutcome,
}

/// Outcome of processing one group photo.
#[derive(Debug, Clone, Serialize)]
pub struct GroupResult {
    pub date: NaiveDate,
    pub faces_found: usize,
    pub auto: Vec<AutoMark>,
    /// Faces that could not be assigned to anyone.
    pub ambiguous_faces: Vec<AmbiguousFace>,
    /// Students still without attendance for the day, for the manual pass.
    pub unmatched_people: Vec<PersonRef>,
    /// Set when the photo could not be processed at all.
    pub extraction_failure: Option<String>,
    pub processing_ms: u64,
}

impl GroupResult {
    /// Number of students this photo newly marked present.
    pub fn newly_marked(&self) -> usize {
        self.auto.iter().filter(|m| m.outcome.is_new()).count()
    }
}

/// Attendance operations exposed to the web layer.
#[derive(Clone)]
pub struct AttendanceService {
    store: Store,
    engine: EngineHandle,
    matcher: SignatureMatcher,
    photo_dir: PathBuf,
}

impl AttendanceService {
    pub fn new(
        store: Store,
        engine: EngineHandle,
        matcher: SignatureMatcher,
        photo_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            engine,
            matcher,
            photo_dir,
        }
    }

    /// Open the database and start the extraction engine from `config`.
    pub async fn open(
        config: &Config,
        extractor: Box<dyn FaceExtractor>,
    ) -> Result<Self, ServiceError> {
        let store = Store::open(&config.db_path).await?;
        let engine = spawn_engine(extractor, config.extraction_budget())?;
        tracing::info!(
            db = %config.db_path.display(),
            metric = %config.metric,
            threshold = config.match_threshold,
            budget_ms = config.extraction_timeout_ms,
            "attendance service ready"
        );
        Ok(Self::new(
            store,
            engine,
            config.matcher(),
            config.photo_dir.clone(),
        ))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // --- Group photo -----------------------------------------------------

    /// Identify every student in a group photo and mark them present.
    ///
    /// Extraction problems never fail the call: the photo is treated as
    /// having no faces and the reason is carried in the result.
    pub async fn reconcile_photo(
        &self,
        photo: &[u8],
        date: NaiveDate,
    ) -> Result<GroupResult, ServiceError> {
        let started = Instant::now();
        let taken_at = Utc::now();
        let roster = self.store.roster().await?;

        let (observations, extraction_failure) = match self.engine.extract(photo.to_vec()).await {
            Ok(faces) => (faces, None),
            Err(e) => {
                tracing::warn!(error = %e, "extraction failed; treating photo as having no faces");
                (Vec::new(), Some(e.to_string()))
            }
        };
        if observations.is_empty() && extraction_failure.is_none() {
            tracing::info!("no faces detected in group photo");
        }

        let outcome = reconcile(&observations, &roster, &self.matcher);

        let mut auto = Vec::with_capacity(outcome.auto.len());
        let mut claimed = HashSet::new();
        for claim in &outcome.auto {
            let person = &roster[claim.person];
            let request = MarkRequest::auto(&person.id, date, claim.score).at(taken_at);
            match self.store.mark(request).await {
                Ok(mark) => {
                    claimed.insert(person.id.as_str());
                    auto.push(AutoMark {
                        person: person.summary(),
                        score: claim.score,
                        face: claim.face,
                        region: observations[claim.face].region,
                        outcome: mark,
                    });
                }
                Err(StoreError::PersonNotFound(id)) => {
                    tracing::warn!(
                        person = %id,
                        "matched person was deleted mid-reconciliation; skipping"
                    );
                    claimed.insert(person.id.as_str());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let unmatched_people: Vec<PersonRef> = self
            .store
            .list_unmarked(date, &roster)
            .await?
            .iter()
            .filter(|p| !claimed.contains(p.id.as_str()))
            .map(Person::summary)
            .collect();

        let processing_ms = started.elapsed().as_millis() as u64;
        let photo_path = self.keep_group_photo(photo, date).await;
        let result = GroupResult {
            date,
            faces_found: observations.len(),
            auto,
            ambiguous_faces: outcome.ambiguous_faces,
            unmatched_people,
            extraction_failure,
            processing_ms,
        };

        self.store
            .record_photo(NewPhotoLog {
                date,
                taken_at,
                faces_found: result.faces_found,
                auto_marked: result.newly_marked(),
                ambiguous: result.ambiguous_faces.len(),
                processing_ms,
                photo_path,
            })
            .await?;

        tracing::info!(
            %date,
            faces = result.faces_found,
            matched = result.auto.len(),
            newly_marked = result.newly_marked(),
            ambiguous = result.ambiguous_faces.len(),
            unmatched = result.unmatched_people.len(),
            processing_ms,
            "group photo processed"
        );
        Ok(result)
    }

    // --- Manual backup ---------------------------------------------------

    /// Teacher-confirmed attendance for someone the photo missed.
    pub async fn mark_manual(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<MarkOutcome, ServiceError> {
        Ok(self.store.mark(MarkRequest::manual(person_id, date)).await?)
    }

    /// Manual mark confirmed with the day's verification code. A code that
    /// does not match the token issued for `date` is refused with
    /// [`StoreError::CodeRejected`] and nothing is written.
    pub async fn mark_verified(
        &self,
        person_id: &str,
        date: NaiveDate,
        code: &str,
    ) -> Result<MarkOutcome, ServiceError> {
        Ok(self
            .store
            .mark(MarkRequest::verified(person_id, date, code))
            .await?)
    }

    /// Mark several students at once. Unknown IDs are skipped.
    /// Returns how many entries were newly created.
    pub async fn mark_manual_many(
        &self,
        person_ids: &[String],
        date: NaiveDate,
    ) -> Result<usize, ServiceError> {
        let mut marked = 0;
        for id in person_ids {
            match self.store.mark(MarkRequest::manual(id, date)).await {
                Ok(outcome) if outcome.is_new() => marked += 1,
                Ok(_) => {}
                Err(StoreError::PersonNotFound(id)) => {
                    tracing::warn!(person = %id, "skipping unknown student");
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(
            %date,
            requested = person_ids.len(),
            marked,
            "manual attendance recorded"
        );
        Ok(marked)
    }

    /// Students with no attendance yet on `date`.
    pub async fn unmarked(&self, date: NaiveDate) -> Result<Vec<Person>, ServiceError> {
        let roster = self.store.roster().await?;
        Ok(self.store.list_unmarked(date, &roster).await?)
    }

    // --- Enrollment ------------------------------------------------------

    /// Enroll a student from one or more photos, one signature per photo.
    ///
    /// Every photo must yield a usable face; otherwise nothing is stored.
    pub async fn enroll(
        &self,
        new: NewPerson,
        photos: Vec<Vec<u8>>,
    ) -> Result<Person, ServiceError> {
        let (signatures, infos) = self.signatures_from(&photos).await?;
        let person = self.store.insert_person(new, signatures, Utc::now()).await?;

        let dir = self.person_dir(&person.id);
        if let Err(e) = save_photos(&dir, 0, &photos, &infos).await {
            tracing::error!(
                id = %person.id,
                error = %e,
                "saving enrollment photos failed; rolling back"
            );
            self.store.delete_person(&person.id).await?;
            remove_dir(&dir).await?;
            return Err(e.into());
        }

        Ok(person)
    }

    /// Add another reference photo to an enrolled student.
    /// Returns the new number of signatures.
    ///
    /// The photo file is written before the signature, and removed again if
    /// the signature cannot be stored.
    pub async fn add_photo(&self, person_id: &str, photo: Vec<u8>) -> Result<usize, ServiceError> {
        let person = self
            .store
            .get_person(person_id)
            .await?
            .ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))?;
        let (signature, info) = self.signature_from(0, &photo).await?;

        let dir = self.person_dir(person_id);
        let path = photo_path(&dir, person.signatures.len(), &info);
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, &photo).await
        }
        .await;
        if let Err(e) = written {
            discard_file(&path).await;
            return Err(e.into());
        }

        match self.store.add_signature(person_id, signature).await {
            Ok(count) => Ok(count),
            Err(e) => {
                discard_file(&path).await;
                Err(e.into())
            }
        }
    }

    /// Replace all reference photos of a student.
    ///
    /// New files are staged first; the signatures are replaced only once
    /// they are on disk, and restored if the staged files cannot be moved
    /// into place.
    pub async fn replace_photos(
        &self,
        person_id: &str,
        photos: Vec<Vec<u8>>,
    ) -> Result<(), ServiceError> {
        let previous = self
            .store
            .get_person(person_id)
            .await?
            .ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))?;
        let (signatures, infos) = self.signatures_from(&photos).await?;

        let staging = self.photo_dir.join(STAGING_DIR).join(person_id);
        let staged = async {
            remove_dir(&staging).await?;
            save_photos(&staging, 0, &photos, &infos).await
        }
        .await;
        if let Err(e) = staged {
            discard_dir(&staging).await;
            return Err(e.into());
        }

        if let Err(e) = self.store.replace_signatures(person_id, signatures).await {
            discard_dir(&staging).await;
            return Err(e.into());
        }

        if let Err(e) = self.swap_in(person_id, &staging).await {
            tracing::error!(
                id = person_id,
                error = %e,
                "moving new photos into place failed; restoring previous signatures"
            );
            self.store
                .replace_signatures(person_id, previous.signatures)
                .await?;
            discard_dir(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove a student with all of their attendance and photos.
    pub async fn delete_person(&self, person_id: &str) -> Result<Person, ServiceError> {
        let person = self.store.delete_person(person_id).await?;
        remove_dir(&self.person_dir(person_id)).await?;
        Ok(person)
    }

    /// One signature per photo, in order. Fails on the first unusable photo.
    async fn signatures_from(
        &self,
        photos: &[Vec<u8>],
    ) -> Result<(Vec<Signature>, Vec<PhotoInfo>), EnrollmentError> {
        if photos.is_empty() {
            return Err(EnrollmentError::NoPhotos);
        }
        let mut signatures = Vec::with_capacity(photos.len());
        let mut infos = Vec::with_capacity(photos.len());
        for (i, photo) in photos.iter().enumerate() {
            let (signature, info) = self.signature_from(i, photo).await?;
            signatures.push(signature);
            infos.push(info);
        }
        Ok((signatures, infos))
    }

    /// Extract the enrollment signature from one photo: the most confident
    /// face, largest on ties.
    async fn signature_from(
        &self,
        index: usize,
        photo: &[u8],
    ) -> Result<(Signature, PhotoInfo), EnrollmentError> {
        let info = probe_photo(photo).map_err(|source| EnrollmentError::Unreadable {
            photo: index,
            source,
        })?;

        let faces = self
            .engine
            .extract(photo.to_vec())
            .await
            .map_err(|source| EnrollmentError::Extraction {
                photo: index,
                source,
            })?;

        let best = best_face(faces).ok_or(EnrollmentError::NoFace { photo: index })?;
        best.signature
            .check(self.matcher.dimension)
            .map_err(|defect| EnrollmentError::Malformed {
                photo: index,
                defect,
            })?;

        tracing::debug!(
            photo = index,
            confidence = best.region.confidence,
            width = info.width,
            height = info.height,
            "enrollment face selected"
        );
        Ok((best.signature, info))
    }

    fn person_dir(&self, person_id: &str) -> PathBuf {
        self.photo_dir.join(person_id)
    }

    /// Move staged photos over the person's directory. The old directory
    /// is set aside first and put back if the move fails.
    async fn swap_in(&self, person_id: &str, staging: &Path) -> std::io::Result<()> {
        let dir = self.person_dir(person_id);
        let backup = self
            .photo_dir
            .join(STAGING_DIR)
            .join(format!("{person_id}.previous"));
        remove_dir(&backup).await?;

        let had_previous = match tokio::fs::rename(&dir, &backup).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        if let Err(e) = tokio::fs::rename(staging, &dir).await {
            if had_previous {
                if let Err(restore) = tokio::fs::rename(&backup, &dir).await {
                    tracing::error!(
                        id = person_id,
                        error = %restore,
                        "could not restore old photos"
                    );
                }
            }
            return Err(e);
        }
        discard_dir(&backup).await;
        Ok(())
    }

    /// Keep a copy of a processed group photo, named by its digest.
    /// Unreadable photos and write failures are logged and skipped.
    async fn keep_group_photo(&self, photo: &[u8], date: NaiveDate) -> Option<String> {
        let info = probe_photo(photo).ok()?;
        let dir = self.photo_dir.join(GROUP_DIR).join(date.to_string());
        let path = dir.join(format!("{}.{}", photo_digest(photo), info.extension()));
        let saved = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, photo).await
        }
        .await;
        match saved {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not keep group photo");
                None
            }
        }
    }

    // --- Reporting -------------------------------------------------------

    pub async fn roster(&self) -> Result<Vec<Person>, ServiceError> {
        Ok(self.store.roster().await?)
    }

    /// Look a student up by ID, falling back to roll number.
    pub async fn find_person(&self, id_or_roll: &str) -> Result<Option<Person>, ServiceError> {
        if let Some(person) = self.store.get_person(id_or_roll).await? {
            return Ok(Some(person));
        }
        Ok(self.store.find_by_roll(id_or_roll).await?)
    }

    pub async fn export(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ExportRow>, ServiceError> {
        Ok(self.store.export(from, to).await?)
    }

    pub async fn summary(&self, date: NaiveDate) -> Result<DaySummary, ServiceError> {
        Ok(self.store.day_summary(date).await?)
    }

    pub async fn photo_logs(&self, date: NaiveDate) -> Result<Vec<PhotoLog>, ServiceError> {
        Ok(self.store.photo_logs(date).await?)
    }

    // --- Daily code ------------------------------------------------------

    pub async fn token(&self, date: NaiveDate) -> Result<DailyToken, ServiceError> {
        Ok(self.store.token_for(date).await?)
    }

    pub async fn verify_token(&self, date: NaiveDate, code: &str) -> Result<bool, ServiceError> {
        Ok(self.store.verify_token(date, code).await?)
    }
}

fn best_face(faces: Vec<FaceObservation>) -> Option<FaceObservation> {
    faces.into_iter().max_by(|a, b| {
        a.region
            .confidence
            .partial_cmp(&b.region.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.region
                    .area()
                    .partial_cmp(&b.region.area())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    })
}

fn photo_path(dir: &Path, position: usize, info: &PhotoInfo) -> PathBuf {
    dir.join(format!("{position}.{}", info.extension()))
}

async fn save_photos(
    dir: &Path,
    first_position: usize,
    photos: &[Vec<u8>],
    infos: &[PhotoInfo],
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for (i, (photo, info)) in photos.iter().zip(infos).enumerate() {
        tokio::fs::write(photo_path(dir, first_position + i, info), photo).await?;
    }
    Ok(())
}

/// Remove a directory tree; a missing directory is fine.
async fn remove_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Best-effort cleanup after a failed write.
async fn discard_dir(dir: &Path) {
    if let Err(e) = remove_dir(dir).await {
        tracing::warn!(path = %dir.display(), error = %e, "cleanup failed");
    }
}

async fn discard_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), error = %e, "cleanup failed");
        }
        _ => {}
    }
}
