// Eviction of working copies that left the control list

use std::fs;
use waffle_core::{DatasetControlList, DatasetEntry};
use waffle_git::DatasetLayout;

fn entry(slug: &str, repo: &str, branches: &[&str]) -> DatasetEntry {
    DatasetEntry {
        slug: slug.to_string(),
        repo_id: repo.to_string(),
        branches: branches.iter().map(|b| b.to_string()).collect(),
        default_branch: Some(branches[0].to_string()),
        is_private: false,
        fetcher_identity: None,
    }
}

fn materialize(layout: &DatasetLayout, dataset: &DatasetEntry, branch: &str) {
    let dir = layout.branch_dir(dataset, branch);
    fs::create_dir_all(dir.join("ddf")).unwrap();
    fs::write(dir.join("datapackage.json"), "{}").unwrap();
    fs::write(dir.join("ddf").join("data.csv"), "geo,time\n").unwrap();
}

#[tokio::test]
async fn test_removed_dataset_and_unlisted_branch_are_evicted() {
    let root = tempfile::tempdir().unwrap();
    let layout = DatasetLayout::new(root.path(), "datapackage.json");

    let ds1 = entry("ds1", "acme/ddf--ds1", &["master", "dev"]);
    let ds2 = entry("ds2", "other-org/ddf--ds2", &["master"]);
    materialize(&layout, &ds1, "master");
    materialize(&layout, &ds1, "dev");
    materialize(&layout, &ds1, "feature");
    materialize(&layout, &ds2, "master");

    // ds2 leaves the control list, ds1 stops tracking "feature"
    let list = DatasetControlList::new(vec![ds1.clone()]);
    let removed = layout.cleanup(&list).await.unwrap();

    assert!(!root.path().join("other-org").exists());
    assert!(!layout.branch_dir(&ds1, "feature").exists());
    assert!(layout.is_materialized(&ds1, "master").await);
    assert!(layout.is_materialized(&ds1, "dev").await);
    assert!(
        layout
            .branch_dir(&ds1, "master")
            .join("ddf")
            .join("data.csv")
            .exists()
    );
    assert_eq!(removed.len(), 2);

    // Idempotent
    assert!(layout.cleanup(&list).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_removed_repo_under_listed_owner() {
    let root = tempfile::tempdir().unwrap();
    let layout = DatasetLayout::new(root.path(), "datapackage.json");

    let kept = entry("kept", "acme/kept", &["main"]);
    let gone = entry("gone", "acme/gone", &["main"]);
    materialize(&layout, &kept, "main");
    materialize(&layout, &gone, "main");
    fs::write(root.path().join("README"), "not a directory").unwrap();

    let removed = layout
        .cleanup(&DatasetControlList::new(vec![kept.clone()]))
        .await
        .unwrap();
    assert_eq!(removed, vec![layout.repo_dir(&gone)]);
    assert!(layout.is_materialized(&kept, "main").await);
    assert!(root.path().join("README").exists());
}
