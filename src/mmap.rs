use bytemuck::Pod;
use log::debug;
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::{Path, PathBuf};

/// A region of a [`MappedArray`], identified by offset and length in elements.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArraySpan {
    pub offset: usize,
    pub len: usize,
}

impl ArraySpan {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Capacity to grow to so that `required` elements fit.
///
/// Doubling is relative to the smallest power of two that holds `required`, which keeps the
/// number of resizes logarithmic in the total number of appended elements.
pub fn grown_capacity(required: usize) -> usize {
    required.max(1).next_power_of_two() * 2
}

enum Mapping {
    Writable(MmapMut),
    ReadOnly(Mmap),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Writable(mmap) => &mmap[..],
            Mapping::ReadOnly(mmap) => &mmap[..],
        }
    }
}

/// An append-only numeric array backed by a memory-mapped file.
///
/// The array keeps a logical length and an allocated capacity. Appending past the capacity
/// grows the backing file and remaps it; previously written content is preserved and the file
/// keeps its identity. Callers hold on to [`ArraySpan`]s rather than slices, so a resize never
/// leaves a dangling view behind.
///
/// Arrays opened with [`open_read_only`](Self::open_read_only) reject every write.
pub struct MappedArray<T: Pod> {
    path: PathBuf,
    file: File,
    mmap: Mapping,
    len: usize,
    capacity: usize,
    n_resizes: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> MappedArray<T> {
    /// Create a new array at the given path, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let capacity = capacity.max(1);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(Self::byte_len(capacity)?)?;
        let mmap = Mapping::Writable(unsafe { MmapMut::map_mut(&file)? });
        debug!(
            "Created mapped array {} with capacity {}",
            path.display(),
            capacity
        );
        Ok(Self {
            path,
            file,
            mmap,
            len: 0,
            capacity,
            n_resizes: 0,
            _marker: PhantomData,
        })
    }

    /// Open an existing array whose first `len` elements are in use, for further appends.
    pub fn open<P: AsRef<Path>>(path: P, len: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut capacity = Self::check_file_len(&path, &file, len)?;
        if capacity == 0 {
            file.set_len(Self::byte_len(1)?)?;
            capacity = 1;
        }
        let mmap = Mapping::Writable(unsafe { MmapMut::map_mut(&file)? });
        Ok(Self {
            path,
            file,
            mmap,
            len,
            capacity,
            n_resizes: 0,
            _marker: PhantomData,
        })
    }

    /// Open an existing array whose first `len` elements are in use, without write access to
    /// the file.
    pub fn open_read_only<P: AsRef<Path>>(path: P, len: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let capacity = Self::check_file_len(&path, &file, len)?;
        let mmap = Mapping::ReadOnly(unsafe { Mmap::map(&file)? });
        Ok(Self {
            path,
            file,
            mmap,
            len,
            capacity,
            n_resizes: 0,
            _marker: PhantomData,
        })
    }

    /// The capacity of an existing file, which must hold at least `len` elements.
    fn check_file_len(path: &Path, file: &File, len: usize) -> Result<usize> {
        let file_len = file.metadata()?.len();
        if file_len % size_of::<T>() as u64 != 0 || file_len < Self::byte_len(len)? {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Mapped array {} has {} bytes, expected at least {} elements of {} bytes",
                    path.display(),
                    file_len,
                    len,
                    size_of::<T>()
                ),
            ));
        }
        Ok((file_len / size_of::<T>() as u64) as usize)
    }

    fn byte_len(n_elements: usize) -> Result<u64> {
        n_elements
            .checked_mul(size_of::<T>())
            .map(|n| n as u64)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidInput,
                    format!("Array of {} elements is too large", n_elements),
                )
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.mmap, Mapping::ReadOnly(_))
    }

    fn writable_mmap(&mut self) -> Result<&mut MmapMut> {
        match self.mmap {
            Mapping::Writable(ref mut mmap) => Ok(mmap),
            Mapping::ReadOnly(_) => Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("Mapped array {} is read-only", self.path.display()),
            )),
        }
    }

    /// Number of times the backing file has been grown since it was created or opened.
    pub fn n_resizes(&self) -> usize {
        self.n_resizes
    }

    /// Grow the backing file to hold `new_capacity` elements.
    ///
    /// Capacity never shrinks; requests at or below the current capacity are no-ops.
    pub fn resize(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.capacity {
            return Ok(());
        }

        self.writable_mmap()?.flush()?;
        self.file.set_len(Self::byte_len(new_capacity)?)?;
        self.mmap = Mapping::Writable(unsafe { MmapMut::map_mut(&self.file)? });
        debug!(
            "Resized mapped array {} from {} to {} elements",
            self.path.display(),
            self.capacity,
            new_capacity
        );
        self.capacity = new_capacity;
        self.n_resizes += 1;
        Ok(())
    }

    /// Make sure `additional` more elements fit, growing with [`grown_capacity`] if needed.
    ///
    /// Returns whether the array was resized.
    pub fn reserve(&mut self, additional: usize) -> Result<bool> {
        let required = self.len + additional;
        if required <= self.capacity {
            return Ok(false);
        }
        self.resize(grown_capacity(required))?;
        Ok(true)
    }

    /// Append values to the end of the array and return the span they were written to.
    pub fn append(&mut self, values: &[T]) -> Result<ArraySpan> {
        self.reserve(values.len())?;
        let span = ArraySpan {
            offset: self.len,
            len: values.len(),
        };
        self.elements_mut(span)?.copy_from_slice(values);
        self.len += values.len();
        Ok(span)
    }

    /// Append values produced by an iterator of known length.
    pub fn extend<I>(&mut self, values: I) -> Result<ArraySpan>
    where
        I: ExactSizeIterator<Item = T>,
    {
        self.reserve(values.len())?;
        let span = ArraySpan {
            offset: self.len,
            len: values.len(),
        };
        for (dst, src) in self.elements_mut(span)?.iter_mut().zip(values) {
            *dst = src;
        }
        self.len += span.len;
        Ok(span)
    }

    fn elements_mut(&mut self, span: ArraySpan) -> Result<&mut [T]> {
        assert!(span.end() <= self.capacity);
        let n_bytes = self.capacity * size_of::<T>();
        let mmap = self.writable_mmap()?;
        let all: &mut [T] = bytemuck::cast_slice_mut(&mut mmap[..n_bytes]);
        Ok(&mut all[span.offset..span.end()])
    }

    /// The elements covered by a span previously returned by this array.
    pub fn slice(&self, span: ArraySpan) -> &[T] {
        assert!(
            span.end() <= self.len,
            "Span {:?} is out of bounds for mapped array of length {}",
            span,
            self.len
        );
        &self.as_slice()[span.offset..span.end()]
    }

    /// All elements written so far.
    pub fn as_slice(&self) -> &[T] {
        let n_bytes = self.len * size_of::<T>();
        bytemuck::cast_slice(&self.mmap.bytes()[..n_bytes])
    }

    /// Write changes back to the file; a no-op for read-only arrays.
    pub fn flush(&self) -> Result<()> {
        match self.mmap {
            Mapping::Writable(ref mmap) => mmap.flush(),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grown_capacity() {
        assert_eq!(2, grown_capacity(0));
        assert_eq!(2, grown_capacity(1));
        assert_eq!(8, grown_capacity(3));
        assert_eq!(8, grown_capacity(4));
        assert_eq!(16, grown_capacity(5));
        assert_eq!(8192, grown_capacity(4097));
    }

    #[test]
    fn test_append_and_read_back_across_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut arr = MappedArray::<f32>::create(dir.path().join("values"), 2).unwrap();

        let mut spans = Vec::new();
        let mut expected = Vec::new();
        for i in 0..100 {
            let chunk = (0..i % 7).map(|j| (i * 10 + j) as f32).collect::<Vec<_>>();
            spans.push((arr.append(&chunk).unwrap(), chunk.clone()));
            expected.extend(chunk);
        }

        assert!(arr.n_resizes() > 1);
        assert_eq!(expected.len(), arr.len());
        assert!(arr.len() <= arr.capacity());
        assert!(arr.capacity().is_power_of_two());
        assert_eq!(&expected[..], arr.as_slice());
        for (span, chunk) in spans {
            assert_eq!(&chunk[..], arr.slice(span));
        }
    }

    #[test]
    fn test_resize_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut arr = MappedArray::<u32>::create(dir.path().join("values"), 16).unwrap();
        arr.append(&[1, 2, 3]).unwrap();
        arr.resize(4).unwrap();
        assert_eq!(16, arr.capacity());
        assert_eq!(0, arr.n_resizes());

        arr.resize(64).unwrap();
        assert_eq!(64, arr.capacity());
        assert_eq!(&[1, 2, 3], arr.as_slice());
        assert_eq!(
            64 * size_of::<u32>() as u64,
            std::fs::metadata(arr.path()).unwrap().len()
        );
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values");
        {
            let mut arr = MappedArray::<u64>::create(&path, 4).unwrap();
            arr.extend(vec![5u64, 6, 7, 8, 9].into_iter()).unwrap();
            arr.flush().unwrap();
        }

        let arr = MappedArray::<u64>::open(&path, 5).unwrap();
        assert_eq!(&[5, 6, 7, 8, 9], arr.as_slice());
        assert!(!arr.is_read_only());
        assert!(MappedArray::<u64>::open(&path, 1000).is_err());
    }

    #[test]
    fn test_open_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values");
        {
            let mut arr = MappedArray::<u32>::create(&path, 4).unwrap();
            arr.append(&[1, 2, 3]).unwrap();
            arr.flush().unwrap();
        }
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&path, permissions).unwrap();

        let mut arr = MappedArray::<u32>::open_read_only(&path, 3).unwrap();
        assert!(arr.is_read_only());
        assert_eq!(&[1, 2, 3], arr.as_slice());
        assert_eq!(4, arr.capacity());
        arr.flush().unwrap();

        let err = arr.append(&[4]).unwrap_err();
        assert_eq!(ErrorKind::PermissionDenied, err.kind());
        assert_eq!(ErrorKind::PermissionDenied, arr.resize(64).unwrap_err().kind());
        assert_eq!(&[1, 2, 3], arr.as_slice());
        assert!(MappedArray::<u32>::open_read_only(&path, 5).is_err());
    }
}
