//! Survey platform clients implementing [`crate::contract::SurveyPlatform`].

pub mod odk;
pub mod surveycto;

pub use odk::OdkPlatform;
pub use surveycto::{QualityClassification, ReviewStatus, SubmissionUpdate, SurveyCtoPlatform};

use crate::contract::{AttachmentSink, StorageSystem};

/// Resolve where attachments should go for a sync run: the submission
/// storage by default, a separate system when given, nowhere when disabled
/// or when the resolved backend doesn't hold attachments.
pub(crate) fn resolve_attachment_storage<'a>(
    storage: &'a dyn StorageSystem,
    attachments: AttachmentSink<'a>,
) -> Option<&'a dyn StorageSystem> {
    let resolved = match attachments {
        AttachmentSink::Disabled => None,
        AttachmentSink::WithSubmissions => Some(storage),
        AttachmentSink::Separate(separate) => Some(separate),
    };
    resolved.filter(|candidate| candidate.attachments_supported())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockStorageSystem;

    #[test]
    fn attachment_sink_resolution_respects_backend_support() {
        let mut supported = MockStorageSystem::new();
        supported.expect_attachments_supported().return_const(true);
        let mut unsupported = MockStorageSystem::new();
        unsupported.expect_attachments_supported().return_const(false);

        assert!(resolve_attachment_storage(&supported, AttachmentSink::WithSubmissions).is_some());
        assert!(resolve_attachment_storage(&unsupported, AttachmentSink::WithSubmissions).is_none());
        assert!(
            resolve_attachment_storage(&unsupported, AttachmentSink::Separate(&supported))
                .is_some()
        );
        assert!(resolve_attachment_storage(&supported, AttachmentSink::Disabled).is_none());
    }
}
