//! Source-checkout identification recorded in build status documents.

use git2::Repository;
use std::path::Path;

/// Commit and branch of the git checkout containing `dir`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkout {
    pub commit: Option<String>,
    pub branch: Option<String>,
}

impl Checkout {
    /// Best effort: outside a repository, or on a repository without
    /// commits, both fields stay empty.
    #[must_use]
    pub fn discover(dir: &Path) -> Self {
        let repo = match Repository::discover(dir) {
            Ok(repo) => repo,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), "no git checkout: {}", e.message());
                return Self::default();
            }
        };
        let Ok(head) = repo.head() else {
            return Self::default();
        };
        let commit = head.peel_to_commit().ok().map(|c| c.id().to_string());
        let branch = head
            .is_branch()
            .then(|| head.shorthand().map(str::to_string))
            .flatten();
        Self { commit, branch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_without_commits_has_no_checkout() {
        let dir = tempfile::tempdir().expect("tempdir");
        Repository::init(dir.path()).expect("init");
        assert_eq!(Checkout::discover(dir.path()), Checkout::default());
    }

    #[test]
    fn committed_repository_reports_commit_and_branch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Repository::init(dir.path()).expect("init");
        let signature = git2::Signature::now("kgforge", "kgforge@example.org").expect("signature");
        let tree_id = repo.index().expect("index").write_tree().expect("tree");
        let tree = repo.find_tree(tree_id).expect("find tree");
        let oid = repo
            .commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
            .expect("commit");

        let checkout = Checkout::discover(dir.path());
        assert_eq!(checkout.commit, Some(oid.to_string()));
        assert!(checkout.branch.is_some());
    }
}
