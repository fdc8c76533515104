use std::cmp::Ordering;

use super::*;

fn descriptor_with_both_patches() -> &'static str {
    r#"
id = "app-1.2.0"
version = "1.2.0"
type = "minor"
channel = "release"
details_url = "https://example.test/releases/1.2.0"

[[patches]]
type = "partial"
url = "https://example.test/patches/app-1.1.0-1.2.0.partial.tar.gz"
hash_algorithm = "sha256"
hash_value = "abc123"
byte_size = 2048

[[patches]]
type = "complete"
url = "https://example.test/patches/app-1.2.0.complete.tar.gz"
hash_algorithm = "sha256"
hash_value = "def456"
byte_size = 409600
"#
}

#[test]
fn compare_versions_follows_documented_scoring() {
    assert_eq!(compare_versions("0.6.1+", "0.6.1"), Ordering::Greater);
    assert_eq!(compare_versions("1.2.3", "1.2.3+"), Ordering::Less);
    assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
    assert_eq!(compare_versions("2.0", "1.9.9"), Ordering::Greater);
    assert_eq!(compare_versions("1.0.0", "0.9.9"), Ordering::Greater);
}

#[test]
fn compare_versions_is_antisymmetric() {
    let versions = ["0.6.1", "0.6.1+", "1.0", "1.2.3", "2.0", "1.9.9", "3"];
    for a in versions {
        for b in versions {
            let forward = compare_versions(a, b);
            let backward = compare_versions(b, a);
            assert_eq!(
                forward,
                backward.reverse(),
                "compare({a}, {b}) must mirror compare({b}, {a})"
            );
        }
    }
}

#[test]
fn compare_versions_ignores_components_beyond_three() {
    assert_eq!(compare_versions("1.2.3.9", "1.2.3"), Ordering::Equal);
    assert_eq!(compare_versions("1.2.3.9", "1.2.3.1"), Ordering::Equal);
}

#[test]
fn compare_versions_scores_non_numeric_components_by_leading_digits() {
    // "9a" parses its leading digits; "beta" scores 0.
    assert_eq!(compare_versions("1.9a", "1.9"), Ordering::Equal);
    assert_eq!(compare_versions("1.beta", "1.0"), Ordering::Equal);
}

#[test]
fn is_valid_version_accepts_dotted_integers_with_optional_plus() {
    assert!(is_valid_version("1"));
    assert!(is_valid_version("1.2"));
    assert!(is_valid_version("1.2.3"));
    assert!(is_valid_version("1.2.3+"));
    assert!(!is_valid_version(""));
    assert!(!is_valid_version("beta"));
    assert!(!is_valid_version("1..2"));
    assert!(!is_valid_version("1.+"));
}

#[test]
fn parse_update_descriptor() {
    let descriptor = UpdateDescriptor::from_toml_str(descriptor_with_both_patches())
        .expect("descriptor should parse");
    assert_eq!(descriptor.id, "app-1.2.0");
    assert_eq!(descriptor.version, "1.2.0");
    assert_eq!(descriptor.update_type, UpdateType::Minor);
    assert_eq!(descriptor.channel, "release");
    assert_eq!(descriptor.patches.len(), 2);
    assert_eq!(descriptor.patches[0].patch_type, PatchType::Partial);
    assert_eq!(descriptor.patches[1].patch_type, PatchType::Complete);
    assert_eq!(descriptor.patches[1].byte_size, 409_600);
}

#[test]
fn descriptor_rejects_empty_patch_url() {
    let raw = r#"
id = "app-1.2.0"
version = "1.2.0"
type = "minor"
channel = "release"

[[patches]]
type = "complete"
url = ""
hash_algorithm = "sha256"
hash_value = "abc"
byte_size = 10
"#;
    let err = UpdateDescriptor::from_toml_str(raw).expect_err("empty URL must be rejected");
    assert!(
        err.to_string().contains("patch without a URL"),
        "unexpected error: {err}"
    );
}

#[test]
fn update_prefers_partial_patch_and_keeps_complete_in_reserve() {
    let descriptor = UpdateDescriptor::from_toml_str(descriptor_with_both_patches())
        .expect("descriptor should parse");
    let update = Update::from_descriptor(descriptor).expect("update should build");

    let selected = update.selected_patch().expect("a patch must be selected");
    assert_eq!(selected.patch_type, PatchType::Partial);
    assert!(!update.is_complete_update);
    assert!(update.can_fall_back_to_complete());
}

#[test]
fn select_patch_flips_selection_exactly_once() {
    let descriptor = UpdateDescriptor::from_toml_str(descriptor_with_both_patches())
        .expect("descriptor should parse");
    let mut update = Update::from_descriptor(descriptor).expect("update should build");

    update
        .select_patch(PatchType::Complete)
        .expect("complete patch must be selectable");
    assert!(update.is_complete_update);
    assert_eq!(
        update.patches.iter().filter(|patch| patch.selected).count(),
        1
    );
    assert_eq!(
        update.selected_patch().expect("selected").patch_type,
        PatchType::Complete
    );
}

#[test]
fn fallback_is_exhausted_once_the_complete_patch_failed() {
    let descriptor = UpdateDescriptor::from_toml_str(descriptor_with_both_patches())
        .expect("descriptor should parse");
    let mut update = Update::from_descriptor(descriptor).expect("update should build");

    update
        .patch_of_type_mut(PatchType::Complete)
        .expect("complete patch exists")
        .state = PatchState::FailedVerification;
    assert!(!update.can_fall_back_to_complete());
}

#[test]
fn update_rejects_partial_without_complete_sibling() {
    let raw = r#"
id = "app-1.2.0"
version = "1.2.0"
type = "minor"
channel = "release"

[[patches]]
type = "partial"
url = "https://example.test/partial.tar.gz"
hash_algorithm = "sha256"
hash_value = "abc"
byte_size = 10
"#;
    let descriptor = UpdateDescriptor::from_toml_str(raw).expect("descriptor should parse");
    let err = Update::from_descriptor(descriptor)
        .expect_err("partial without complete fallback must be rejected");
    assert!(
        err.to_string().contains("without a complete fallback"),
        "unexpected error: {err}"
    );
}

#[test]
fn status_marker_round_trip() {
    let cases = [
        UpdateStatus::new(StatusState::Pending),
        UpdateStatus::new(StatusState::Applying),
        UpdateStatus::new(StatusState::PendingService),
        UpdateStatus::new(StatusState::Applied),
        UpdateStatus::new(StatusState::Succeeded),
        UpdateStatus::failed(6),
    ];
    for status in cases {
        let line = status.to_line();
        let parsed = UpdateStatus::parse(&line).expect("status line must parse");
        assert_eq!(parsed, status, "round trip failed for '{line}'");
    }

    assert_eq!(UpdateStatus::failed(6).to_line(), "failed: 6");
    assert!(UpdateStatus::parse("exploded").is_err());
    assert!(UpdateStatus::parse("failed: not-a-code").is_err());
}

#[test]
fn status_file_round_trip_and_missing_file() {
    let mut path = std::env::temp_dir();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    path.push(format!("upshift-core-tests-{}-{}", std::process::id(), nanos));
    let status_path = path.join("update.status");

    assert!(read_status_file(&status_path)
        .expect("missing marker reads as none")
        .is_none());

    write_status_file(&status_path, UpdateStatus::failed(4)).expect("must write marker");
    let read = read_status_file(&status_path)
        .expect("must read marker")
        .expect("marker should exist");
    assert_eq!(read.state, StatusState::Failed);
    assert_eq!(read.error_code, Some(4));

    let _ = std::fs::remove_dir_all(&path);
}

#[test]
fn failure_reason_codes_round_trip() {
    let reasons = [
        FailureReason::Network,
        FailureReason::PermissionDenied,
        FailureReason::FileInUse,
        FailureReason::CorruptArchive,
        FailureReason::WrongSize,
        FailureReason::VerificationFailed,
        FailureReason::SwapError,
        FailureReason::ElevationUnavailable,
    ];
    for reason in reasons {
        assert_eq!(FailureReason::from_code(reason.code()), reason);
    }
    assert_eq!(FailureReason::from_code(131), FailureReason::Generic(131));
}

#[test]
fn layout_paths_keep_update_state_out_of_the_install_tree() {
    let layout = UpdateLayout::new("/opt/app", "/var/lib/app/updates");
    assert_eq!(layout.patch_dir(), layout.updates_dir().join("0"));
    assert_eq!(
        layout.status_path(),
        layout.updates_dir().join("update.status")
    );
    assert_eq!(
        layout.archive_path(ArchiveType::TarGz),
        layout.updates_dir().join("0").join("patch.tar.gz")
    );
    assert_eq!(
        layout.archive_part_path(ArchiveType::TarGz),
        layout.updates_dir().join("0").join("patch.tar.gz.part")
    );
    assert_eq!(
        layout.install_log_path(),
        layout.updates_dir().join("0").join("update.log")
    );
    assert_eq!(
        layout.last_log_path(),
        layout.updates_dir().join("last-update.log")
    );
    assert_eq!(layout.stage_dir(), layout.updates_dir().join("staged"));
    assert!(!layout
        .status_path()
        .starts_with(layout.install_dir()));
}

#[test]
fn archive_type_inference() {
    assert_eq!(
        ArchiveType::infer_from_url("https://example.test/patch.tar.gz"),
        Some(ArchiveType::TarGz)
    );
    assert_eq!(
        ArchiveType::infer_from_url("https://example.test/patch.tgz?token=x"),
        Some(ArchiveType::TarGz)
    );
    assert_eq!(
        ArchiveType::infer_from_url("https://example.test/patch.zip"),
        Some(ArchiveType::Zip)
    );
    assert_eq!(ArchiveType::infer_from_url("https://example.test/patch"), None);
    assert_eq!(ArchiveType::parse("tar.gz"), Some(ArchiveType::TarGz));
    assert_eq!(ArchiveType::parse("unknown"), None);
}
