//! Creation paths: raw allocate, restore from backup, image import.

use super::{first_error, request_uri, Inner, Volume, VolumeManager};
use crate::error::{Result, StorageError};
use crate::image::{self, DiskFormat, ImageInfo, ImageRepository};
use crate::jobs::JobContext;
use crate::lock::{Claim, ClaimInfo};
use crate::lvm::LogicalVolume;
use crate::observability::metrics;
use crate::status::{ResourceKind, StatusUpdate, VolumeStatus};
use crate::tag::VolumeRole;
use tracing::{info, instrument};

impl VolumeManager {
    /// Allocate an empty volume. Synchronous; the volume is `ACTIVE` on return.
    ///
    /// Re-creating an existing plain volume of at least `size` bytes returns it
    /// unchanged.
    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn create(&self, id: &str, size: u64) -> Result<Volume> {
        let inner = &self.inner;
        let size_arg = size.to_string();
        let uri = request_uri("PUT", id, &[("size", &size_arg)]);
        let _guard = match inner.claim_for_create(id, ClaimInfo::new(uri).interruptible(false))? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => return self.get(id).await,
        };

        if let Some(existing) = inner.find(id).await? {
            if existing.role == VolumeRole::Plain && existing.size >= size {
                return inner.describe(existing);
            }
            return Err(StorageError::AlreadyExists { kind: "Volume", id: id.to_string() });
        }

        let lv = inner.vg.create(id, size, &VolumeRole::Plain).await?;
        metrics::record_volume_created("raw");
        inner.describe(lv)
    }

    /// Allocate a volume and populate it from backup `backup_id` of
    /// `source_volume_id` in the background.
    ///
    /// The volume is `BUILDING` until the job finishes; the outcome is
    /// reported as `ACTIVE` or `ERROR`. A failed restore leaves the volume
    /// tagged as a restore target, and repeating the identical request
    /// retries it.
    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn restore(
        &self,
        id: &str,
        size: u64,
        source_volume_id: &str,
        backup_id: &str,
    ) -> Result<Volume> {
        let inner = &self.inner;
        let store = inner.backup_store()?;
        let size_arg = size.to_string();
        let uri = request_uri(
            "PUT",
            id,
            &[
                ("backup_id", backup_id),
                ("size", &size_arg),
                ("source_volume_id", source_volume_id),
            ],
        );
        let guard = match inner.claim_for_create(id, ClaimInfo::new(uri).interruptible(true))? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => return self.get(id).await,
        };

        let role = VolumeRole::RestoreTarget {
            source_volume_id: source_volume_id.to_string(),
            backup_id: backup_id.to_string(),
        };
        let lv = match inner.find(id).await? {
            Some(lv) if lv.role == role => {
                info!("Retrying restore into existing target");
                lv
            }
            Some(_) => {
                return Err(StorageError::AlreadyExists { kind: "Volume", id: id.to_string() })
            }
            None => inner.vg.create(id, size, &role).await?,
        };

        let work_inner = self.inner.clone();
        let ok_inner = self.inner.clone();
        let err_inner = self.inner.clone();
        let (ok_id, err_id) = (id.to_string(), id.to_string());
        let (source, backup) = (source_volume_id.to_string(), backup_id.to_string());

        inner
            .jobs
            .run(
                inner.job("restore", id),
                guard,
                move |ctx: JobContext| async move {
                    let bytes = store
                        .restore(&source, &backup, &lv.path, ctx.cancel_token().clone())
                        .await?;
                    // A delete may have interrupted us; it owns the tag now.
                    ctx.check_cancelled()?;
                    let current = work_inner.vg.get(&lv.id).await?;
                    work_inner.vg.set_role(&current, &VolumeRole::Plain).await?;
                    Ok(bytes)
                },
                move |bytes| async move {
                    metrics::record_volume_created("backup");
                    ok_inner
                        .report(
                            ResourceKind::Volumes,
                            &ok_id,
                            StatusUpdate::new(VolumeStatus::Active).field("restored_bytes", bytes),
                        )
                        .await;
                },
                move |e| async move {
                    err_inner
                        .report(
                            ResourceKind::Volumes,
                            &err_id,
                            StatusUpdate::new(VolumeStatus::Error).field("error", e.to_string()),
                        )
                        .await;
                },
            )
            .await?;

        self.get(id).await
    }

    /// Allocate a volume and fill it from image `image_id` in the background.
    ///
    /// The image is validated before anything is allocated. The download
    /// lands on a scratch volume `<id>-convert`, which is scrubbed and
    /// removed whatever the outcome.
    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn import_image(&self, id: &str, size: u64, image_id: &str) -> Result<Volume> {
        let inner = &self.inner;
        let images = inner.image_repository()?;
        let size_arg = size.to_string();
        let uri = request_uri("PUT", id, &[("image_id", image_id), ("size", &size_arg)]);

        let info = images.describe(image_id).await?;
        let format = info.validate_for(size)?;

        let claim_info = ClaimInfo::new(uri.clone()).interruptible(true);
        let guard = match inner.claim_for_create(id, claim_info)? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => return self.get(id).await,
        };

        let role = VolumeRole::ConvertScratch { image_id: image_id.to_string() };
        let dest = match inner.find(id).await? {
            Some(lv) if lv.role == role => lv,
            Some(_) => {
                return Err(StorageError::AlreadyExists { kind: "Volume", id: id.to_string() })
            }
            None => inner.vg.create(id, size, &role).await?,
        };

        let scratch_id = format!("{}-convert", id);
        let claim_info = ClaimInfo::new(uri).interruptible(true);
        let scratch_guard = match inner.claim(&scratch_id, claim_info)? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(record) => {
                return Err(StorageError::ResourceBusy {
                    resource: inner.resource_path(&scratch_id).display().to_string(),
                    owner_uri: record.uri,
                });
            }
        };

        let work_inner = self.inner.clone();
        let ok_inner = self.inner.clone();
        let err_inner = self.inner.clone();
        let (ok_id, err_id) = (id.to_string(), id.to_string());

        inner
            .jobs
            .run(
                inner.job("import", id),
                guard,
                move |ctx: JobContext| async move {
                    let scratch = work_inner.scratch_volume(&scratch_id, &info, &role).await?;
                    let populated = work_inner
                        .populate_from_image(images.as_ref(), &info, format, &scratch, &dest, &ctx)
                        .await;
                    let cleanup = work_inner.destroy(&scratch, &scratch_guard).await;
                    drop(scratch_guard);
                    first_error(populated, cleanup, "scratch volume")?;

                    ctx.check_cancelled()?;
                    let current = work_inner.vg.get(&dest.id).await?;
                    work_inner.vg.set_role(&current, &VolumeRole::Plain).await?;
                    Ok(())
                },
                move |()| async move {
                    metrics::record_volume_created("image");
                    let update = StatusUpdate::new(VolumeStatus::Active);
                    ok_inner.report(ResourceKind::Volumes, &ok_id, update).await;
                },
                move |e| async move {
                    err_inner
                        .report(
                            ResourceKind::Volumes,
                            &err_id,
                            StatusUpdate::new(VolumeStatus::Error).field("error", e.to_string()),
                        )
                        .await;
                },
            )
            .await?;

        self.get(id).await
    }
}

impl Inner {
    /// Reuse a scratch volume left by an interrupted import of the same
    /// image, or allocate one large enough for the download.
    async fn scratch_volume(
        &self,
        scratch_id: &str,
        info: &ImageInfo,
        role: &VolumeRole,
    ) -> Result<LogicalVolume> {
        match self.find(scratch_id).await? {
            Some(lv) if lv.role == *role => Ok(lv),
            Some(_) => {
                Err(StorageError::AlreadyExists { kind: "Volume", id: scratch_id.to_string() })
            }
            None => {
                let size = info.size.div_ceil(512).max(1) * 512;
                self.vg.create(scratch_id, size, role).await
            }
        }
    }

    async fn populate_from_image(
        &self,
        images: &dyn ImageRepository,
        info: &ImageInfo,
        format: DiskFormat,
        scratch: &LogicalVolume,
        dest: &LogicalVolume,
        ctx: &JobContext,
    ) -> Result<()> {
        let fetched = images.fetch(&info.id, &scratch.path, ctx.cancel_token().clone()).await?;
        ctx.check_cancelled()?;
        match format {
            DiskFormat::Raw => {
                self.copy(&scratch.path, &dest.path, fetched, ctx.cancel_token()).await?;
            }
            other => {
                image::convert_to_raw(
                    self.vg.runner().as_ref(),
                    &self.config.qemu_img,
                    other,
                    &scratch.path,
                    &dest.path,
                )
                .await?;
            }
        }
        info!(image_id = %info.id, format = %format, bytes = fetched, "Image written");
        Ok(())
    }
}
