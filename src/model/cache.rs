use super::train::HyperParam;
use super::tree::TreeNode;
use crate::{Result, SparseMat};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Identifies a tree-building call by its training data and the hyper-parameters shaping the tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the shapes and non-zero counts of both matrices, the raw values of the first and last
    /// feature rows, and the seed, branching, depth and clustering settings.
    ///
    /// Linear-classifier settings are left out since they do not affect the tree shape.
    pub fn new(y: &SparseMat, x: &SparseMat, hyper_param: &HyperParam) -> Self {
        let mut hasher = Sha256::new();
        for n in [y.rows(), y.cols(), x.rows(), x.cols(), y.nnz(), x.nnz()] {
            hasher.update((n as u64).to_le_bytes());
        }
        hasher.update(hyper_param.seed.to_le_bytes());
        hasher.update((hyper_param.max_children as u64).to_le_bytes());
        hasher.update((hyper_param.max_depth as u64).to_le_bytes());
        hasher.update((hyper_param.cluster.max_iter as u64).to_le_bytes());
        hasher.update(hyper_param.cluster.tol.to_le_bytes());
        for i in [0, x.rows().saturating_sub(1)] {
            if let Some(row) = x.outer_view(i) {
                hasher.update((row.nnz() as u64).to_le_bytes());
                for &v in row.data() {
                    hasher.update(v.to_le_bytes());
                }
            }
        }

        let digest = hasher.finalize();
        let hex = digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        Fingerprint(hex[..32].to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A directory of previously built tree shapes, keyed by fingerprint.
///
/// Entries are never evicted unless a maximum number of entries is set.
pub struct TreeCache {
    dir: PathBuf,
    max_entries: Option<usize>,
}

impl TreeCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_entries: None,
        }
    }

    /// Keep at most the given number of entries, removing the least recently written first.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.as_str()))
    }

    /// Return the cached tree for the fingerprint, or build, store and return a new one.
    ///
    /// Unreadable entries are treated as misses and overwritten.
    pub fn get_or_build<F>(&self, fingerprint: &Fingerprint, build: F) -> Result<TreeNode>
    where
        F: FnOnce() -> TreeNode,
    {
        let path = self.entry_path(fingerprint);
        if path.is_file() {
            match Self::read_entry(&path) {
                Ok(root) => {
                    info!("Loaded tree (no weights) from cache {}", path.display());
                    return Ok(root);
                }
                Err(e) => warn!(
                    "Failed to read cached tree {}, rebuilding: {}",
                    path.display(),
                    e
                ),
            }
        }

        let root = build();
        self.write_entry(&path, &root)?;
        info!("Saved tree (no weights) to cache {}", path.display());
        if let Some(max_entries) = self.max_entries {
            self.evict(max_entries)?;
        }
        Ok(root)
    }

    fn read_entry(path: &Path) -> Result<TreeNode> {
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn write_entry(&self, path: &Path, root: &TreeNode) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        // Write to a temporary file first so that readers never see a partial entry
        let tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, root)?;
            writer.flush()?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn evict(&self, max_entries: usize) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().map_or(false, |ext| ext == "json"))
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, entry.path()))
            })
            .collect::<Vec<_>>();
        if entries.len() <= max_entries {
            return Ok(());
        }

        entries.sort();
        let n_evicted = entries.len() - max_entries;
        for (_, path) in entries.into_iter().take(n_evicted) {
            info!("Evicting cached tree {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mat_util::IndexValuePairLists;
    use const_default::ConstDefault;
    use std::cell::Cell;

    fn seeded(seed: u64) -> HyperParam {
        HyperParam {
            seed,
            ..HyperParam::DEFAULT
        }
    }

    fn matrices() -> (SparseMat, SparseMat) {
        let y = vec![vec![(0, 1.)], vec![(1, 1.)], vec![(0, 1.), (2, 1.)]].copy_to_csrmat(3);
        let x = vec![vec![(0, 0.5)], vec![(1, 2.)], vec![(0, 1.), (3, 1.5)]].copy_to_csrmat(4);
        (y, x)
    }

    fn shape() -> TreeNode {
        TreeNode::Internal {
            label_map: vec![0, 1, 2],
            children: vec![
                TreeNode::Leaf {
                    label_map: vec![0, 2],
                },
                TreeNode::Leaf { label_map: vec![1] },
            ],
        }
    }

    #[test]
    fn test_fingerprint() {
        let (y, x) = matrices();
        let fingerprint = Fingerprint::new(&y, &x, &seeded(1));
        assert_eq!(32, fingerprint.as_str().len());
        assert_eq!(fingerprint, Fingerprint::new(&y, &x, &seeded(1)));
        assert_ne!(fingerprint, Fingerprint::new(&y, &x, &seeded(2)));

        let x2 = vec![vec![(0, 0.5)], vec![(1, 2.)], vec![(0, 1.), (3, 1.25)]].copy_to_csrmat(4);
        assert_ne!(fingerprint, Fingerprint::new(&y, &x2, &seeded(1)));
    }

    #[test]
    fn test_fingerprint_covers_tree_hyper_params() {
        let (y, x) = matrices();
        let base = seeded(1);
        let fingerprint = Fingerprint::new(&y, &x, &base);

        let mut changed = vec![
            HyperParam {
                max_children: 10,
                ..base.clone()
            },
            HyperParam {
                max_depth: 1,
                ..base.clone()
            },
            base.clone(),
            base.clone(),
        ];
        changed[2].cluster.max_iter += 1;
        changed[3].cluster.tol *= 2.;
        for hyper_param in &changed {
            assert_ne!(fingerprint, Fingerprint::new(&y, &x, hyper_param));
        }

        // Linear settings do not shape the tree
        let mut relinear = base.clone();
        relinear.linear.c = 10.;
        relinear.cache_dir = Some(PathBuf::from("elsewhere"));
        assert_eq!(fingerprint, Fingerprint::new(&y, &x, &relinear));
    }

    #[test]
    fn test_get_or_build_hits_after_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TreeCache::new(dir.path().join("tree_cache"));
        let (y, x) = matrices();
        let fingerprint = Fingerprint::new(&y, &x, &seeded(1));

        let n_builds = Cell::new(0);
        let build = || {
            n_builds.set(n_builds.get() + 1);
            shape()
        };
        assert_eq!(shape(), cache.get_or_build(&fingerprint, build).unwrap());
        assert_eq!(shape(), cache.get_or_build(&fingerprint, build).unwrap());
        assert_eq!(1, n_builds.get());
        assert!(cache.entry_path(&fingerprint).is_file());
    }

    #[test]
    fn test_corrupted_entry_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TreeCache::new(dir.path());
        let (y, x) = matrices();
        let fingerprint = Fingerprint::new(&y, &x, &seeded(1));
        fs::write(cache.entry_path(&fingerprint), b"{\"Internal\": {\"label_").unwrap();

        assert_eq!(shape(), cache.get_or_build(&fingerprint, shape).unwrap());
        assert_eq!(shape(), TreeCache::read_entry(&cache.entry_path(&fingerprint)).unwrap());
    }

    #[test]
    fn test_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TreeCache::new(dir.path()).with_max_entries(2);
        let (y, x) = matrices();
        for seed in 0..4 {
            cache
                .get_or_build(&Fingerprint::new(&y, &x, &seeded(seed)), shape)
                .unwrap();
        }
        let n_entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(2, n_entries);
    }
}
