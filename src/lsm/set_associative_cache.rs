//! Set-associative cache with CLOCK Nth-Chance eviction.
//!
//! Purpose: provide a compact, cache-line-friendly value cache for LSM
//! point lookups.
//!
//! Invariants and safety rules:
//! - `WAYS` is in {2, 4, 16} and is a power of two.
//! - `TagT::BITS` is 8 or 16.
//! - `CLOCK_BITS` is 1, 2, or 4 (counts fit in a `u8`).
//! - `CLOCK_HAND_BITS == log2(WAYS)` and is 1, 2, or 4, so packed clock
//!   hands introduce no padding.
//! - `CACHE_LINE_SIZE` is a power of two; value alignment is a power of two
//!   (`VALUE_ALIGNMENT == 0` uses the value type's alignment).
//! - `value_count_max` is a power of two and a multiple of `WAYS` and
//!   `VALUE_COUNT_MAX_MULTIPLE`, so every arena spans whole cache lines.
//! - Slots are occupied iff their count is non-zero; tags may be stale.
//! - Values are `Copy` and are not dropped; storage is reused without
//!   destructors.
//! - This cache is not thread-safe; callers must synchronize shared access.
//!
//! High-level algorithm:
//! 1. Hash the key to 64-bit entropy.
//! 2. The low `log2(sets)` bits select a set; the bits above them form the
//!    slot tag via `Tag::truncate`.
//! 3. On lookup, match tags across all ways at once, then confirm keys for
//!    occupied slots only.
//! 4. On insert, scan from the per-set clock hand, skipping pinned ways and
//!    decrementing counts until a zero-count slot is found, then claim it
//!    and advance the hand past it.
//!
//! Design choices:
//! - Tags are stored separately to keep hot metadata compact.
//! - Counts and clock hands are packed into 64-bit words to reduce overhead.
//! - Values are stored in an aligned buffer so each set is contiguous.
//! - Insertion is `put_no_clobber`: the caller guarantees the key is absent
//!   and initializes the returned slot in place, so inserts never copy a
//!   value through an intermediate.

use std::{
    alloc::{alloc, dealloc, Layout as AllocLayout},
    fmt,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::NonNull,
};

use tracing::{debug, trace};

use crate::stdx::BitMaskIterator;

#[cfg(target_arch = "x86")]
use core::arch::x86 as x86_arch;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as x86_arch;

/// A short, partial hash of a key, stored alongside cached values.
///
/// Because the tag is small, collisions are possible: `tag(k1) == tag(k2)`
/// does not imply `k1 == k2`. However, most of the time, where the tag
/// differs, a full key comparison can be avoided. Since tags are 16-32x
/// smaller than keys, they can also be kept hot in cache.
///
/// Guarantees / invariants:
/// - `truncate` must be deterministic for a given entropy value.
/// - This cache only accepts tags with `BITS` of 8 or 16 (enforced at init).
pub trait Tag: Copy + Eq + PartialEq + Default {
    /// The number of bits in this tag type.
    const BITS: usize;

    /// Extracts a tag from hash entropy by truncating to the tag width.
    ///
    /// The cache passes entropy already shifted past the set-index bits, so
    /// tag and set index never share hash bits.
    fn truncate(entropy: u64) -> Self;
}

/// 8-bit tag implementation.
impl Tag for u8 {
    const BITS: usize = 8;

    #[inline]
    fn truncate(entropy: u64) -> Self {
        entropy as u8
    }
}

/// 16-bit tag implementation.
impl Tag for u16 {
    const BITS: usize = 16;

    #[inline]
    fn truncate(entropy: u64) -> Self {
        entropy as u16
    }
}

/// Defines the key/value types and operations required by a set-associative
/// cache.
///
/// Guarantees / invariants:
/// - `key_from_value` must return the same key used to hash the value.
/// - `hash` must be deterministic and equal for equal keys.
/// - A well-distributed hash improves set balance and hit rate; set
///   selection uses the low bits, the tag the bits above them.
pub trait SetAssociativeCacheContext {
    /// The key type used for lookups.
    type Key: Copy + Eq;

    /// The value type stored in the cache.
    type Value: Copy;

    /// Extracts the key from a cached value.
    fn key_from_value(value: &Self::Value) -> Self::Key;

    /// Computes a hash of the given key.
    fn hash(key: Self::Key) -> u64;
}

/// Packed unsigned integers stored densely in 64-bit words.
///
/// Restricted to widths that divide a word exactly, so no value ever
/// straddles a word boundary. Slot `i` occupies bits
/// `[BITS * (i % per_word), BITS * (i % per_word) + BITS)` of word
/// `i / per_word`. Because `get`/`set` shift within whole words rather than
/// reinterpreting bytes, the logical layout is the little-endian one on any
/// host.
///
/// Guarantees / invariants:
/// - `BITS` is a power of two and at most 32.
/// - Values are stored densely without padding.
///
/// Complexity:
/// - `get`/`set` are O(1).
#[derive(Debug)]
pub struct PackedUnsignedIntegerArray<const BITS: usize> {
    words: Box<[u64]>,
}

impl<const BITS: usize> PackedUnsignedIntegerArray<BITS> {
    const WORD_BITS: usize = 64;

    #[inline]
    const fn uints_per_word() -> usize {
        Self::WORD_BITS / BITS
    }

    #[inline]
    const fn mask_value() -> u64 {
        (1u64 << BITS) - 1
    }

    const fn validate() {
        assert!(BITS.is_power_of_two());
        assert!(BITS <= 32);
        assert!(Self::WORD_BITS % BITS == 0);
    }

    /// Returns the number of 64-bit words needed to store `len` values.
    #[inline]
    pub const fn words_for_len(len: usize) -> usize {
        let bits = len * BITS;
        bits.div_ceil(Self::WORD_BITS)
    }

    /// Allocates a zeroed array with `words_len` 64-bit words.
    pub fn new_zeroed(words_len: usize) -> Self {
        const { Self::validate() };
        Self {
            words: vec![0u64; words_len].into_boxed_slice(),
        }
    }

    /// Wraps an existing word buffer without copying.
    pub fn from_words(words: Vec<u64>) -> Self {
        const { Self::validate() };
        Self {
            words: words.into_boxed_slice(),
        }
    }

    /// Returns the backing storage as 64-bit words.
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Returns the backing storage as mutable 64-bit words.
    #[inline]
    pub fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }

    /// Returns the packed unsigned integer at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn get(&self, index: u64) -> u64 {
        let uints_per_word = Self::uints_per_word() as u64;
        let word_index = index / uints_per_word;
        let shift = (index % uints_per_word) as usize * BITS;
        debug_assert!(word_index < self.words.len() as u64);
        (self.words[word_index as usize] >> shift) & Self::mask_value()
    }

    /// Sets the packed unsigned integer at `index` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds. In debug builds, also panics if
    /// `value` does not fit in `BITS`.
    #[inline]
    pub fn set(&mut self, index: u64, value: u64) {
        debug_assert!(value <= Self::mask_value());
        let uints_per_word = Self::uints_per_word() as u64;
        let word_index = index / uints_per_word;
        let shift = (index % uints_per_word) as usize * BITS;
        let mask = Self::mask_value() << shift;
        debug_assert!(word_index < self.words.len() as u64);
        let word = &mut self.words[word_index as usize];
        *word = (*word & !mask) | (value << shift);
    }
}

/// A heap-allocated buffer with custom alignment, used as the values arena.
///
/// Elements are stored as `MaybeUninit<T>`; the cache tracks initialization
/// through slot counts (a slot is initialized iff its count is non-zero).
/// `Drop` deallocates memory but does NOT run element destructors, which is
/// fine because cached values are `Copy`.
///
/// Invariants:
/// - `len > 0`.
/// - `alignment` is a power of two and `alignment >= align_of::<T>()`.
/// - `size_of::<T>()` is a multiple of `alignment` so each element is
///   aligned.
#[derive(Debug)]
struct AlignedBuf<T> {
    ptr: NonNull<MaybeUninit<T>>,
    len: usize,
    layout: AllocLayout,
    _marker: PhantomData<T>,
}

impl<T> AlignedBuf<T> {
    /// Allocates an uninitialized buffer with the specified length and
    /// alignment.
    ///
    /// # Panics
    ///
    /// Panics if the length/alignment invariants are violated or if
    /// allocation fails.
    fn new_uninit(len: usize, alignment: usize) -> Self {
        assert!(len > 0);
        assert!(alignment >= align_of::<T>());
        assert!(alignment.is_power_of_two());
        assert!(size_of::<T>().is_multiple_of(alignment));

        let bytes = len.checked_mul(size_of::<T>()).expect("size overflow");
        let layout = AllocLayout::from_size_align(bytes, alignment).expect("bad layout");

        // SAFETY: Layout is valid (size > 0, alignment is a power of two,
        // size fits in isize). Null is checked below.
        let raw = unsafe { alloc(layout) } as *mut MaybeUninit<T>;
        let ptr = NonNull::new(raw).expect("oom");

        Self {
            ptr,
            len,
            layout,
            _marker: PhantomData,
        }
    }

    /// Returns a reference to the element at `index`.
    ///
    /// # Safety
    ///
    /// The slot at `index` must have been initialized through the reference
    /// returned by [`uninit_mut`](Self::uninit_mut).
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[inline]
    unsafe fn get_ref(&self, index: usize) -> &T {
        assert!(index < self.len);
        // SAFETY: Caller guarantees the slot is initialized. Pointer is
        // valid and aligned.
        unsafe { (&*self.ptr.as_ptr().add(index)).assume_init_ref() }
    }

    /// Reads a copy of the element at `index`.
    ///
    /// # Safety
    ///
    /// The slot at `index` must have been initialized.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[inline]
    unsafe fn read_copy(&self, index: usize) -> T
    where
        T: Copy,
    {
        assert!(index < self.len);
        // SAFETY: Caller guarantees the slot is initialized. T: Copy
        // prevents double-drop.
        unsafe { (&*self.ptr.as_ptr().add(index)).assume_init_read() }
    }

    /// Returns the possibly-uninitialized slot at `index` for writing.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    #[inline]
    fn uninit_mut(&mut self, index: usize) -> &mut MaybeUninit<T> {
        assert!(index < self.len);
        // SAFETY: Index is bounds-checked; the pointer is valid and aligned.
        // The slot is handed out as MaybeUninit, so nothing is assumed
        // about its contents.
        unsafe { &mut *self.ptr.as_ptr().add(index) }
    }
}

impl<T> Drop for AlignedBuf<T> {
    fn drop(&mut self) {
        // SAFETY: Layout matches the one used in new_uninit. Element
        // destructors are intentionally not run (Copy values only).
        unsafe {
            dealloc(self.ptr.as_ptr() as *mut u8, self.layout);
        }
    }
}

/// Configuration options for initializing a cache instance.
pub struct Options<'a> {
    /// Human-readable name used for diagnostics.
    pub name: &'a str,
}

/// Per-lookup view of the set a key maps to.
///
/// Each key maps to a set of `WAYS` consecutive slots; this bundles the
/// derived tag with the base index (`offset`) of those slots in the backing
/// arrays.
#[derive(Clone, Copy)]
struct Set<TagT> {
    /// Tag derived from the lookup key's hash entropy.
    tag: TagT,
    /// Base index for this set in the tag/value/count arrays.
    offset: u64,
}

/// N-way set-associative cache with CLOCK Nth-Chance eviction.
///
/// Each key maps to one set of `WAYS` consecutive slots that may contain
/// its value. Tags provide a compact hash prefix to avoid full key
/// comparisons on most misses, while counts/clocks drive the replacement
/// policy.
///
/// Guarantees / invariants:
/// - A slot is occupied iff its count is non-zero; tags may be stale when a
///   slot is free.
/// - Tag matches are advisory; a full key comparison is authoritative.
/// - A present key occupies exactly one slot of its set.
///
/// Eviction:
/// - CLOCK Nth-Chance; counts saturate on hit and are decremented as the
///   insertion sweep passes. The sweep starts at the per-set clock hand and
///   the hand advances past the claimed slot. Pinned ways are passed over
///   without decrement. A similar algorithm called "RRIParoo" is described
///   in "Kangaroo: Caching Billions of Tiny Objects on Flash". For general
///   background, see:
///   https://en.wikipedia.org/wiki/Page_replacement_algorithm.
///
/// Layout:
/// - Tags, values, counts, and clock hands are each sized to whole cache
///   lines.
///
/// Concurrency:
/// - Not thread-safe. Lookups take `&mut self` because they bump counts;
///   returned value references borrow the cache, so any mutating call
///   invalidates them at compile time.
pub struct SetAssociativeCache<
    'a,
    C,
    TagT,
    const WAYS: usize,
    const CLOCK_BITS: usize,
    const CACHE_LINE_SIZE: usize,
    const VALUE_ALIGNMENT: usize,
    const CLOCK_HAND_BITS: usize,
> where
    C: SetAssociativeCacheContext,
    TagT: Tag,
{
    /// Human-readable cache name for diagnostics.
    name: &'a str,
    /// Number of sets in the cache; always a power of two.
    sets: u64,

    /// Short, partial hashes of keys stored alongside cached values.
    tags: Vec<TagT>,

    /// Cache values; a slot holds an initialized value iff its count is
    /// non-zero.
    values: AlignedBuf<C::Value>,

    /// Per-slot access counts, tracking recent reads.
    ///
    /// * A count is incremented when a value is accessed by `get`.
    /// * A count is decremented when an insertion sweep passes the slot.
    /// * A value is evicted when its count reaches zero.
    counts: PackedUnsignedIntegerArray<CLOCK_BITS>,

    /// Per-set clock hand that rotates across ways to find eviction
    /// candidates.
    clocks: PackedUnsignedIntegerArray<CLOCK_HAND_BITS>,

    /// Marker for the cache context's key/value types.
    _marker: PhantomData<C>,
}

impl<
        'a,
        C,
        TagT,
        const WAYS: usize,
        const CLOCK_BITS: usize,
        const CACHE_LINE_SIZE: usize,
        const VALUE_ALIGNMENT: usize,
        const CLOCK_HAND_BITS: usize,
    >
    SetAssociativeCache<
        'a,
        C,
        TagT,
        WAYS,
        CLOCK_BITS,
        CACHE_LINE_SIZE,
        VALUE_ALIGNMENT,
        CLOCK_HAND_BITS,
    >
where
    C: SetAssociativeCacheContext,
    TagT: Tag,
{
    /// Smallest multiple required for `value_count_max` to keep the values
    /// and counts arenas whole multiples of a cache line.
    pub const VALUE_COUNT_MAX_MULTIPLE: u64 = {
        const fn max_u(a: u64, b: u64) -> u64 {
            if a > b {
                a
            } else {
                b
            }
        }

        const fn min_u(a: u64, b: u64) -> u64 {
            if a < b {
                a
            } else {
                b
            }
        }

        let value_size = size_of::<C::Value>() as u64;
        let cache_line = CACHE_LINE_SIZE as u64;
        let ways = WAYS as u64;
        let values_term = (max_u(value_size, cache_line) / min_u(value_size, cache_line)) * ways;
        let counts_term = (cache_line * 8) / CLOCK_BITS as u64;
        max_u(values_term, counts_term)
    };

    #[inline]
    fn value_alignment() -> usize {
        if VALUE_ALIGNMENT == 0 {
            align_of::<C::Value>()
        } else {
            VALUE_ALIGNMENT
        }
    }

    #[inline]
    fn max_count() -> u8 {
        debug_assert!(CLOCK_BITS <= 8);
        ((1u16 << CLOCK_BITS) - 1) as u8
    }

    #[inline]
    fn wrap_way(way: usize) -> usize {
        way & (WAYS - 1)
    }

    #[inline]
    fn index_usize(index: u64) -> usize {
        let idx = index as usize;
        debug_assert_eq!(idx as u64, index);
        idx
    }

    /// Initializes a cache sized for `value_count_max` values.
    ///
    /// `value_count_max` must be a power of two, at least `WAYS`, and a
    /// multiple of `VALUE_COUNT_MAX_MULTIPLE`, so that set selection is a
    /// mask and every arena spans whole cache lines. All four arenas are
    /// allocated here; tag/count/clock state is zeroed via `reset`.
    ///
    /// # Panics
    ///
    /// Panics if any layout invariant is violated (ways/tag bits/clock
    /// bits, cache-line or value alignment constraints, capacity rules), if
    /// computed sizes overflow, or if allocation fails. All layout checks
    /// run before the first allocation.
    pub fn init(value_count_max: u64, options: Options<'a>) -> Self {
        assert!(size_of::<C::Key>().is_power_of_two());
        assert!(size_of::<C::Value>().is_power_of_two());

        match WAYS {
            2 | 4 | 16 => {}
            _ => panic!("invalid number of ways"),
        }

        match TagT::BITS {
            8 | 16 => {}
            _ => panic!("tag bits must be 8 or 16"),
        }

        match CLOCK_BITS {
            1 | 2 | 4 => {}
            _ => panic!("CLOCK_BITS must be 1, 2, or 4"),
        }

        // The hand width must be exactly log2(WAYS); restricting WAYS to
        // {2, 4, 16} keeps it at 1, 2, or 4 bits, which pack into 64-bit
        // words without padding.
        match CLOCK_HAND_BITS {
            1 | 2 | 4 => {}
            _ => panic!("CLOCK_HAND_BITS must be 1, 2, or 4"),
        }
        assert_eq!(1usize << CLOCK_HAND_BITS, WAYS);

        let value_alignment = Self::value_alignment();
        if VALUE_ALIGNMENT != 0 {
            // An explicit override must over-align, not restate the default.
            assert!(VALUE_ALIGNMENT > align_of::<C::Value>());
        }
        assert!(value_alignment.is_power_of_two());
        assert!(size_of::<C::Value>().is_multiple_of(value_alignment));

        assert!(WAYS.is_power_of_two());
        assert!(TagT::BITS.is_power_of_two());
        assert!(CLOCK_BITS.is_power_of_two());
        assert!(CACHE_LINE_SIZE.is_power_of_two());

        assert!(size_of::<C::Key>() <= size_of::<C::Value>());
        assert!(size_of::<C::Key>() < CACHE_LINE_SIZE);
        assert!(CACHE_LINE_SIZE.is_multiple_of(size_of::<C::Key>()));

        if CACHE_LINE_SIZE > size_of::<C::Value>() {
            assert!(CACHE_LINE_SIZE.is_multiple_of(size_of::<C::Value>()));
        } else {
            assert!(size_of::<C::Value>().is_multiple_of(CACHE_LINE_SIZE));
        }

        let ways_u64 = WAYS as u64;
        let cache_line_u64 = CACHE_LINE_SIZE as u64;
        let line_bits = cache_line_u64 * 8;

        let tags_per_line = {
            let divisor = ways_u64 * TagT::BITS as u64;
            assert_eq!(line_bits % divisor, 0);
            line_bits / divisor
        };
        assert!(tags_per_line > 0);

        let clocks_per_line = {
            let divisor = ways_u64 * CLOCK_BITS as u64;
            assert_eq!(line_bits % divisor, 0);
            line_bits / divisor
        };
        assert!(clocks_per_line > 0);

        let clock_hands_per_line = {
            assert_eq!(line_bits % CLOCK_HAND_BITS as u64, 0);
            line_bits / CLOCK_HAND_BITS as u64
        };
        assert!(clock_hands_per_line > 0);

        assert!(value_count_max > 0);
        assert!(value_count_max.is_power_of_two());
        assert!(value_count_max >= ways_u64);
        assert_eq!(value_count_max % ways_u64, 0);
        assert_eq!(value_count_max % Self::VALUE_COUNT_MAX_MULTIPLE, 0);

        let sets = value_count_max / ways_u64;
        assert!(sets.is_power_of_two());

        let tags_size = value_count_max * TagT::BITS as u64 / 8;
        assert!(tags_size >= cache_line_u64);
        assert_eq!(tags_size % cache_line_u64, 0);

        let values_size = value_count_max
            .checked_mul(size_of::<C::Value>() as u64)
            .expect("values size overflow");
        assert!(values_size >= cache_line_u64);
        assert_eq!(values_size % cache_line_u64, 0);

        let counts_bits = value_count_max
            .checked_mul(CLOCK_BITS as u64)
            .expect("counts size overflow");
        assert_eq!(counts_bits % 8, 0);
        let counts_size = counts_bits / 8;
        assert!(counts_size >= cache_line_u64);
        assert_eq!(counts_size % cache_line_u64, 0);
        let counts_words_len = counts_size / 8;

        // The clocks arena is small (one hand per set); round it up to
        // whole cache lines rather than constraining the capacity further.
        let clocks_bits = sets
            .checked_mul(CLOCK_HAND_BITS as u64)
            .expect("clocks size overflow");
        let clocks_size = clocks_bits.div_ceil(line_bits).max(1) * cache_line_u64;
        assert_eq!(clocks_size % 8, 0);
        let clocks_words_len = clocks_size / 8;

        let value_count_max_usize =
            usize::try_from(value_count_max).expect("value_count_max overflows usize");
        let counts_words_len_usize =
            usize::try_from(counts_words_len).expect("counts_words_len overflows usize");
        let clocks_words_len_usize =
            usize::try_from(clocks_words_len).expect("clocks_words_len overflows usize");

        let tags = vec![TagT::default(); value_count_max_usize];
        let values = AlignedBuf::<C::Value>::new_uninit(value_count_max_usize, value_alignment);
        let counts = PackedUnsignedIntegerArray::<CLOCK_BITS>::new_zeroed(counts_words_len_usize);
        let clocks =
            PackedUnsignedIntegerArray::<CLOCK_HAND_BITS>::new_zeroed(clocks_words_len_usize);

        let mut cache = Self {
            name: options.name,
            sets,
            tags,
            values,
            counts,
            clocks,
            _marker: PhantomData,
        };

        cache.reset();
        cache
    }

    /// Empties the cache without freeing memory.
    ///
    /// Tags, counts, and clock hands are zeroed; value bytes are left
    /// untouched because counts alone determine occupancy.
    pub fn reset(&mut self) {
        self.tags.fill(TagT::default());
        self.counts.words_mut().fill(0);
        self.clocks.words_mut().fill(0);
    }

    /// Returns the cache name for diagnostics.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Looks up `key` and returns its slot index.
    ///
    /// On hit, the slot's count is incremented, saturating at the maximum
    /// the `CLOCK_BITS`-wide counter can hold.
    pub fn get_index(&mut self, key: C::Key) -> Option<usize> {
        let set = self.associate(key);
        let way = self.search(set, key)?;

        let index = set.offset + way as u64;
        let count = self.counts_get(index);
        self.counts_set(index, count.saturating_add(1).min(Self::max_count()));
        Some(Self::index_usize(index))
    }

    /// Looks up `key` and returns a reference to the cached value.
    ///
    /// On hit, the slot's count is saturating-incremented; tags, clocks,
    /// and values are never mutated. The returned borrow ties the value to
    /// the cache, so the next mutating call invalidates it at compile time.
    pub fn get(&mut self, key: C::Key) -> Option<&C::Value> {
        let index = self.get_index(key)?;
        // SAFETY: get_index hit, so the slot's count is non-zero and the
        // value is initialized.
        Some(unsafe { self.values.get_ref(index) })
    }

    /// Removes `key` from the cache if present, returning the removed
    /// value. Removing an absent key is a no-op, so remove is idempotent.
    ///
    /// The tag is not cleared; occupancy is tracked by the count.
    pub fn remove(&mut self, key: C::Key) -> Option<C::Value> {
        let set = self.associate(key);
        let way = self.search(set, key)?;

        let index = set.offset + way as u64;
        // SAFETY: search only returns occupied ways, whose values are
        // initialized.
        let removed = unsafe { self.values.read_copy(Self::index_usize(index)) };
        self.counts_set(index, 0);
        Some(removed)
    }

    /// Claims a slot for `key` and returns it for the caller to initialize.
    ///
    /// The caller must guarantee `key` is not already present (asserted in
    /// debug builds) and must write the slot before the next lookup that
    /// could reach it. Equivalent to [`put_no_clobber_pinned`] with a
    /// constantly-false pin predicate.
    ///
    /// [`put_no_clobber_pinned`]: Self::put_no_clobber_pinned
    pub fn put_no_clobber(&mut self, key: C::Key) -> &mut MaybeUninit<C::Value> {
        self.put_no_clobber_pinned(key, |_| false)
    }

    /// Claims a slot for `key`, never evicting a value the predicate pins.
    ///
    /// `pinned` receives a reference directly into the values arena, so a
    /// caller holding a pointer to a cached value can pin by pointer
    /// identity without re-reading the value. It is only ever invoked for
    /// occupied slots.
    ///
    /// Slot selection is a CLOCK sweep from the set's hand: pinned ways are
    /// passed over without decrement; unpinned ways are decremented until
    /// one reaches zero (or is already zero). The hand then advances past
    /// the claimed slot so the next insertion starts behind it.
    ///
    /// The caller must guarantee:
    /// - `key` is not already present (asserted in debug builds);
    /// - fewer than `WAYS` keys are pinned in any one set;
    /// - the returned slot is initialized before the next lookup that could
    ///   reach it.
    ///
    /// # Panics
    ///
    /// Panics if the sweep exceeds its bound, which indicates corrupted
    /// counts or a set with every way pinned.
    pub fn put_no_clobber_pinned<F>(
        &mut self,
        key: C::Key,
        mut pinned: F,
    ) -> &mut MaybeUninit<C::Value>
    where
        F: FnMut(&C::Value) -> bool,
    {
        let set = self.associate(key);
        debug_assert!(
            self.search(set, key).is_none(),
            "put_no_clobber: key already present (cache={})",
            self.name,
        );

        let offset_usize = Self::index_usize(set.offset);
        let clock_index = set.offset / WAYS as u64;
        let mut way = self.clocks_get(clock_index) as usize;
        debug_assert!(way < WAYS);

        // Worst case: one unpinned way at max count, decremented once per
        // sweep of the set. One extra iteration is allowed as margin.
        let clock_iterations_max = WAYS * Self::max_count() as usize;
        let mut iterations = 0usize;
        loop {
            assert!(
                iterations <= clock_iterations_max,
                "clock sweep stuck: counts corrupted or all ways pinned (cache={})",
                self.name,
            );
            iterations += 1;

            let index = set.offset + way as u64;
            let count = self.counts_get(index);
            if count == 0 {
                // Free slot found.
                break;
            }

            // SAFETY: count > 0, so the slot holds an initialized value.
            let occupant = unsafe { self.values.get_ref(offset_usize + way) };
            if pinned(occupant) {
                way = Self::wrap_way(way + 1);
                continue;
            }

            self.counts_set(index, count - 1);
            if count == 1 {
                // Slot just freed; its previous occupant is evicted.
                break;
            }
            way = Self::wrap_way(way + 1);
        }

        let index = set.offset + way as u64;
        debug_assert_eq!(0, self.counts_get(index));

        self.tags[offset_usize + way] = set.tag;
        self.counts_set(index, 1);
        self.clocks_set(clock_index, Self::wrap_way(way + 1) as u8);

        self.values.uninit_mut(offset_usize + way)
    }

    /// Logs the state of the set `key` maps to. Purely diagnostic.
    pub fn inspect(&self, key: C::Key)
    where
        C::Key: fmt::Debug,
        C::Value: fmt::Debug,
        TagT: fmt::Debug,
    {
        let set = self.associate(key);
        let set_index = set.offset / WAYS as u64;
        let offset_usize = Self::index_usize(set.offset);
        debug!(
            cache = self.name,
            key = ?key,
            set = set_index,
            offset = set.offset,
            tag = ?set.tag,
            clock_hand = self.clocks_get(set_index),
            "set state"
        );
        for way in 0..WAYS {
            let count = self.counts_get(set.offset + way as u64);
            if count == 0 {
                trace!(way, count, tag = ?self.tags[offset_usize + way], "free");
            } else {
                // SAFETY: count > 0, so the slot holds an initialized value.
                let value = unsafe { self.values.get_ref(offset_usize + way) };
                trace!(
                    way,
                    count,
                    tag = ?self.tags[offset_usize + way],
                    value = ?value,
                    "occupied"
                );
            }
        }
    }

    // ----- Internals -----

    /// Computes the set metadata for `key` (tag and slot offset).
    ///
    /// Set index and tag come from disjoint bit ranges of the same hash:
    /// the low `log2(sets)` bits pick the set, and the tag truncates the
    /// bits above them.
    #[inline]
    fn associate(&self, key: C::Key) -> Set<TagT> {
        let entropy = C::hash(key);
        let index = entropy & (self.sets - 1);
        let tag = TagT::truncate(entropy >> self.sets.trailing_zeros());
        Set {
            tag,
            offset: index * WAYS as u64,
        }
    }

    /// If the key is present in the set, returns its way index.
    ///
    /// Candidate ways come from the tag-match bitmask; free slots with
    /// stale matching tags are filtered by the count check, and tag
    /// collisions between live keys by the full key comparison.
    #[inline]
    fn search(&self, set: Set<TagT>, key: C::Key) -> Option<usize> {
        let offset_usize = Self::index_usize(set.offset);
        debug_assert!(offset_usize + WAYS <= self.tags.len());
        // SAFETY: The offset is WAYS-aligned and in bounds, so the set's
        // tags form a contiguous [TagT; WAYS].
        let tags = unsafe { &*(self.tags.as_ptr().add(offset_usize) as *const [TagT; WAYS]) };

        for way in BitMaskIterator::new(Self::search_tags(tags, set.tag)) {
            if self.counts_get(set.offset + way as u64) == 0 {
                continue;
            }
            // SAFETY: count > 0, so the slot holds an initialized value.
            let value = unsafe { self.values.get_ref(offset_usize + way) };
            if C::key_from_value(value) == key {
                return Some(way);
            }
        }
        None
    }

    /// Bitmask of ways whose tag matches `tag` (bit `w` set for way `w`).
    ///
    /// The comparison covers all ways, free slots included; callers must
    /// corroborate matches against the counts.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    fn search_tags(tags: &[TagT; WAYS], tag: TagT) -> u16 {
        // SAFETY: SSE2 is baseline on x86_64.
        unsafe { Self::search_tags_sse2(tags, tag) }
    }

    /// Bitmask of ways whose tag matches `tag` (bit `w` set for way `w`).
    #[cfg(target_arch = "x86")]
    #[inline]
    fn search_tags(tags: &[TagT; WAYS], tag: TagT) -> u16 {
        if std::is_x86_feature_detected!("sse2") {
            // SAFETY: guarded by runtime feature detection.
            return unsafe { Self::search_tags_sse2(tags, tag) };
        }

        let mut bits = 0u16;
        for (way, &t) in tags.iter().enumerate() {
            bits |= ((t == tag) as u16) << way;
        }
        bits
    }

    /// Bitmask of ways whose tag matches `tag` (bit `w` set for way `w`).
    #[cfg(target_arch = "aarch64")]
    #[inline]
    fn search_tags(tags: &[TagT; WAYS], tag: TagT) -> u16 {
        // SAFETY: NEON intrinsics are available on all aarch64 targets.
        unsafe { Self::search_tags_neon(tags, tag) }
    }

    /// Bitmask of ways whose tag matches `tag` (bit `w` set for way `w`).
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
    #[inline]
    fn search_tags(tags: &[TagT; WAYS], tag: TagT) -> u16 {
        let mut bits = 0u16;
        for (way, &t) in tags.iter().enumerate() {
            bits |= ((t == tag) as u16) << way;
        }
        bits
    }

    /// Packs a byte-wise SSE movemask of 16-bit lanes into one bit per lane.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[inline(always)]
    fn compress_u16_mask(mask: u16) -> u16 {
        // Keep even bits (lane LSBs), then fold them into the low 8 bits.
        let mut m = mask & 0x5555;
        m = (m | (m >> 1)) & 0x3333;
        m = (m | (m >> 2)) & 0x0F0F;
        m = (m | (m >> 4)) & 0x00FF;
        m
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[target_feature(enable = "sse2")]
    unsafe fn search_tags_sse2(tags: &[TagT; WAYS], tag: TagT) -> u16 {
        if TagT::BITS == 8 {
            let tag_u8: u8 = core::mem::transmute_copy(&tag);
            unsafe { Self::search_tags_sse2_u8(tags.as_ptr() as *const u8, tag_u8) }
        } else {
            let tag_u16: u16 = core::mem::transmute_copy(&tag);
            unsafe { Self::search_tags_sse2_u16(tags.as_ptr() as *const u16, tag_u16) }
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[target_feature(enable = "sse2")]
    unsafe fn search_tags_sse2_u8(tags: *const u8, tag: u8) -> u16 {
        use x86_arch::*;

        let needle = _mm_set1_epi8(tag as i8);
        if WAYS == 16 {
            let vec = _mm_loadu_si128(tags as *const __m128i);
            return _mm_movemask_epi8(_mm_cmpeq_epi8(vec, needle)) as u16;
        }

        // Fewer than 16 ways: stage the tags into a buffer padded with a
        // lane that can never match, so unused lanes contribute no bits.
        let mut lanes = [!tag; 16];
        unsafe { core::ptr::copy_nonoverlapping(tags, lanes.as_mut_ptr(), WAYS) };
        let vec = _mm_loadu_si128(lanes.as_ptr() as *const __m128i);
        _mm_movemask_epi8(_mm_cmpeq_epi8(vec, needle)) as u16
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[target_feature(enable = "sse2")]
    unsafe fn search_tags_sse2_u16(tags: *const u16, tag: u16) -> u16 {
        use x86_arch::*;

        let needle = _mm_set1_epi16(tag as i16);
        if WAYS == 16 {
            let eq0 = _mm_cmpeq_epi16(_mm_loadu_si128(tags as *const __m128i), needle);
            let eq1 = _mm_cmpeq_epi16(_mm_loadu_si128(tags.add(8) as *const __m128i), needle);
            let lo = Self::compress_u16_mask(_mm_movemask_epi8(eq0) as u16);
            let hi = Self::compress_u16_mask(_mm_movemask_epi8(eq1) as u16);
            return lo | (hi << 8);
        }

        let mut lanes = [!tag; 8];
        unsafe { core::ptr::copy_nonoverlapping(tags, lanes.as_mut_ptr(), WAYS) };
        let eq = _mm_cmpeq_epi16(_mm_loadu_si128(lanes.as_ptr() as *const __m128i), needle);
        Self::compress_u16_mask(_mm_movemask_epi8(eq) as u16)
    }

    #[cfg(target_arch = "aarch64")]
    #[target_feature(enable = "neon")]
    unsafe fn search_tags_neon(tags: &[TagT; WAYS], tag: TagT) -> u16 {
        if TagT::BITS == 8 {
            let tag_u8: u8 = core::mem::transmute_copy(&tag);
            unsafe { Self::search_tags_neon_u8(tags.as_ptr() as *const u8, tag_u8) }
        } else {
            let tag_u16: u16 = core::mem::transmute_copy(&tag);
            unsafe { Self::search_tags_neon_u16(tags.as_ptr() as *const u16, tag_u16) }
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[target_feature(enable = "neon")]
    unsafe fn search_tags_neon_u8(tags: *const u8, tag: u8) -> u16 {
        use core::arch::aarch64::*;

        if WAYS == 16 {
            let eq = vceqq_u8(vld1q_u8(tags), vdupq_n_u8(tag));
            let mut lanes = [0u8; 16];
            vst1q_u8(lanes.as_mut_ptr(), eq);
            let mut bits = 0u16;
            for (way, lane) in lanes.iter().enumerate() {
                bits |= ((*lane != 0) as u16) << way;
            }
            return bits;
        }

        let mut padded = [!tag; 8];
        unsafe { core::ptr::copy_nonoverlapping(tags, padded.as_mut_ptr(), WAYS) };
        let eq = vceq_u8(vld1_u8(padded.as_ptr()), vdup_n_u8(tag));
        let mut lanes = [0u8; 8];
        vst1_u8(lanes.as_mut_ptr(), eq);
        let mut bits = 0u16;
        for (way, lane) in lanes.iter().enumerate().take(WAYS) {
            bits |= ((*lane != 0) as u16) << way;
        }
        bits
    }

    #[cfg(target_arch = "aarch64")]
    #[target_feature(enable = "neon")]
    unsafe fn search_tags_neon_u16(tags: *const u16, tag: u16) -> u16 {
        use core::arch::aarch64::*;

        let needle = vdupq_n_u16(tag);
        if WAYS == 16 {
            let eq0 = vceqq_u16(vld1q_u16(tags), needle);
            let eq1 = vceqq_u16(vld1q_u16(tags.add(8)), needle);
            let mut lanes0 = [0u16; 8];
            let mut lanes1 = [0u16; 8];
            vst1q_u16(lanes0.as_mut_ptr(), eq0);
            vst1q_u16(lanes1.as_mut_ptr(), eq1);
            let mut bits = 0u16;
            for (way, lane) in lanes0.iter().enumerate() {
                bits |= ((*lane != 0) as u16) << way;
            }
            for (way, lane) in lanes1.iter().enumerate() {
                bits |= ((*lane != 0) as u16) << (way + 8);
            }
            return bits;
        }

        let mut padded = [!tag; 8];
        unsafe { core::ptr::copy_nonoverlapping(tags, padded.as_mut_ptr(), WAYS) };
        let eq = vceqq_u16(vld1q_u16(padded.as_ptr()), needle);
        let mut lanes = [0u16; 8];
        vst1q_u16(lanes.as_mut_ptr(), eq);
        let mut bits = 0u16;
        for (way, lane) in lanes.iter().enumerate().take(WAYS) {
            bits |= ((*lane != 0) as u16) << way;
        }
        bits
    }

    /// Reads the CLOCK count for the slot at `index`.
    #[inline]
    fn counts_get(&self, index: u64) -> u8 {
        self.counts.get(index) as u8
    }

    /// Writes the CLOCK count for the slot at `index`.
    #[inline]
    fn counts_set(&mut self, index: u64, value: u8) {
        self.counts.set(index, value as u64);
    }

    /// Reads the clock hand for the set at `index`.
    #[inline]
    fn clocks_get(&self, index: u64) -> u8 {
        self.clocks.get(index) as u8
    }

    /// Writes the clock hand for the set at `index`.
    #[inline]
    fn clocks_set(&mut self, index: u64, value: u8) {
        self.clocks.set(index, value as u64);
    }
}
