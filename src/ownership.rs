// Ownership - intrusive reference counting for engine objects
//
// Objects embed a `RefCount` and are shared through `Ref<T>` handles.
// `WeakRef<T>` observes an object without owning it; its validity comes from
// a `LiveRegistry`, not from the raw pointer, so a freed (or reused) address
// never reads as alive.

use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Same guard as `Arc`: a count this large means handles are being leaked.
const MAX_REFCOUNT: u32 = i32::MAX as u32;

/// Identity of a registered object. Ids are never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn get(self) -> u64 {
        self.0
    }
}

// =============================================================================
// LIVENESS REGISTRY
// =============================================================================

/// Record of which counted objects are currently alive.
///
/// Registration happens when the first `Ref` adopts an object, removal when
/// the last `Ref` lets go and before the memory is freed. All access is
/// serialized by one lock, which is what makes `WeakRef::upgrade` sound.
pub struct LiveRegistry {
    live: Mutex<HashSet<ObjectId>>,
    next_id: AtomicU64,
}

impl LiveRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn register(&self) -> ObjectId {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live.lock().insert(id);
        id
    }

    fn unregister(&self, id: ObjectId) {
        let removed = self.live.lock().remove(&id);
        debug_assert!(removed, "object {:?} unregistered twice", id);
    }

    /// Run `f` while holding the registry lock, only if `id` is still alive.
    fn with_live<R>(&self, id: ObjectId, f: impl FnOnce() -> R) -> Option<R> {
        let live = self.live.lock();
        if live.contains(&id) {
            Some(f())
        } else {
            None
        }
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.live.lock().contains(&id)
    }

    /// Number of objects currently alive in this registry.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl fmt::Debug for LiveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveRegistry")
            .field("live", &self.live_count())
            .finish()
    }
}

// =============================================================================
// REFERENCE COUNT
// =============================================================================

struct Registration {
    id: ObjectId,
    type_id: TypeId,
    registry: Arc<LiveRegistry>,
}

/// Counter embedded in every shareable object.
pub struct RefCount {
    strong: AtomicU32,
    owner: OnceLock<Registration>,
}

impl RefCount {
    pub const fn new() -> Self {
        Self {
            strong: AtomicU32::new(0),
            owner: OnceLock::new(),
        }
    }

    /// Current number of strong handles.
    pub fn strong(&self) -> u32 {
        self.strong.load(Ordering::Acquire)
    }

    /// Registry identity, `None` until a `Ref` adopts the object.
    pub fn id(&self) -> Option<ObjectId> {
        self.owner.get().map(|owner| owner.id)
    }

    fn increase(&self) {
        let old = self.strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    /// Returns true when this call dropped the last strong reference.
    fn decrease(&self) -> bool {
        if self.strong.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }

    /// Increment unless the count already reached zero.
    fn try_increase(&self) -> bool {
        let mut current = self.strong.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            if current > MAX_REFCOUNT {
                std::process::abort();
            }
            match self.strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCount")
            .field("strong", &self.strong())
            .field("id", &self.id())
            .finish()
    }
}

/// Objects that can be owned through `Ref<T>`.
///
/// # Safety
///
/// `ref_count` must return a counter stored inside `self`, the same one on
/// every call, and never shared with another object. Use
/// [`impl_ref_counted!`](crate::impl_ref_counted) to implement it.
pub unsafe trait RefCounted: Send + Sync + 'static {
    fn ref_count(&self) -> &RefCount;
}

/// Implement [`RefCounted`] for a type with a `RefCount` field.
#[macro_export]
macro_rules! impl_ref_counted {
    ($ty:ty, $field:ident) => {
        // SAFETY: the counter is a field of the object itself.
        unsafe impl $crate::ownership::RefCounted for $ty {
            fn ref_count(&self) -> &$crate::ownership::RefCount {
                &self.$field
            }
        }
    };
}

// =============================================================================
// STRONG HANDLE
// =============================================================================

/// Owning handle. Cloning adds a reference, dropping removes one; the object
/// is destroyed and deregistered when the count goes from one to zero.
pub struct Ref<T: ?Sized + RefCounted> {
    ptr: Option<NonNull<T>>,
    _owns: PhantomData<T>,
}

// SAFETY: `RefCounted` requires `Send + Sync`, and the count is atomic.
unsafe impl<T: ?Sized + RefCounted> Send for Ref<T> {}
unsafe impl<T: ?Sized + RefCounted> Sync for Ref<T> {}

impl<T: RefCounted> Ref<T> {
    /// Move `value` to the heap and take the first strong reference.
    ///
    /// # Panics
    ///
    /// If `value`'s counter was already adopted by another registry entry.
    pub fn new(value: T, registry: &Arc<LiveRegistry>) -> Self {
        let boxed = Box::new(value);
        let registration = Registration {
            id: registry.register(),
            type_id: TypeId::of::<T>(),
            registry: Arc::clone(registry),
        };
        if let Err(stale) = boxed.ref_count().owner.set(registration) {
            stale.registry.unregister(stale.id);
            panic!("RefCount adopted twice");
        }
        boxed.ref_count().increase();

        Self {
            ptr: Some(NonNull::from(Box::leak(boxed))),
            _owns: PhantomData,
        }
    }

    /// Upcast to a type-erased handle. Moves the reference, no count change.
    pub fn into_dyn(self) -> Ref<dyn RefCounted> {
        let this = ManuallyDrop::new(self);
        Ref {
            ptr: this.ptr.map(|ptr| -> NonNull<dyn RefCounted> { ptr }),
            _owns: PhantomData,
        }
    }

    /// Upcast keeping `self`: the new handle takes its own reference.
    pub fn to_dyn(&self) -> Ref<dyn RefCounted> {
        self.clone().into_dyn()
    }
}

impl<T: ?Sized + RefCounted> Ref<T> {
    pub const fn null() -> Self {
        Self {
            ptr: None,
            _owns: PhantomData,
        }
    }

    /// Adopt an object from a raw pointer, adding one reference.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Ref::as_ptr`] or [`Ref::into_raw`] and the object
    /// must still be owned by at least one strong reference.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        let header = ptr.as_ref().ref_count();
        assert!(header.strong() > 0, "from_raw on an object with no owner");
        header.increase();
        Self {
            ptr: Some(ptr),
            _owns: PhantomData,
        }
    }

    /// Give up the handle without decrementing. Pair with [`Ref::from_raw`]
    /// (which adds its own reference) or the count is leaked.
    pub fn into_raw(self) -> Option<NonNull<T>> {
        ManuallyDrop::new(self).ptr
    }

    /// Alias this handle without contributing a reference.
    ///
    /// # Safety
    ///
    /// The alias must not be used after the last owning handle is dropped.
    /// It is wrapped in `ManuallyDrop` so it never decrements.
    pub unsafe fn copy_without_increment(&self) -> ManuallyDrop<Self> {
        ManuallyDrop::new(Self {
            ptr: self.ptr,
            _owns: PhantomData,
        })
    }

    /// Convert between handle types with a caller-provided pointer cast.
    /// Moves the reference, no count change.
    ///
    /// # Safety
    ///
    /// `f` must return a pointer to the same allocation (an unsizing cast such
    /// as `|p| p as NonNull<dyn Trait>`), never a pointer into a field.
    pub unsafe fn cast<U: ?Sized + RefCounted>(
        self,
        f: impl FnOnce(NonNull<T>) -> NonNull<U>,
    ) -> Ref<U> {
        let this = ManuallyDrop::new(self);
        Ref {
            ptr: this.ptr.map(f),
            _owns: PhantomData,
        }
    }

    /// Downcast to the concrete type the object was created as.
    /// Moves the reference on success, hands `self` back otherwise.
    pub fn downcast<U: RefCounted>(self) -> Result<Ref<U>, Self> {
        let matches = self
            .get()
            .and_then(|object| object.ref_count().owner.get())
            .is_some_and(|owner| owner.type_id == TypeId::of::<U>());
        if !matches {
            return Err(self);
        }
        let this = ManuallyDrop::new(self);
        Ok(Ref {
            ptr: this.ptr.map(NonNull::cast),
            _owns: PhantomData,
        })
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-null handle owns a reference, so the object is alive.
        self.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    /// Strong count of the referenced object, 0 for a null handle.
    pub fn strong_count(&self) -> u32 {
        self.get().map_or(0, |object| object.ref_count().strong())
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.get().and_then(|object| object.ref_count().id())
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        match (a.ptr, b.ptr) {
            (Some(a), Some(b)) => std::ptr::addr_eq(a.as_ptr(), b.as_ptr()),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef::from(self)
    }

    /// Drop this handle's reference and become null.
    ///
    /// Named apart from any method of `T` so that a call through the handle
    /// never means two things.
    pub fn release(&mut self) {
        let Some(ptr) = self.ptr.take() else {
            return;
        };
        // SAFETY: the handle owned one reference, so the object is alive here.
        let header = unsafe { ptr.as_ref() }.ref_count();
        if !header.decrease() {
            return;
        }
        if let Some(owner) = header.owner.get() {
            log::trace!("Destroying ref-counted object {:?}", owner.id);
            // Deregister before freeing: a concurrent upgrade holds the
            // registry lock while it reads the count.
            owner.registry.unregister(owner.id);
        }
        // SAFETY: count reached zero, nobody else can reach the allocation.
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }
}

impl<T: ?Sized + RefCounted> Clone for Ref<T> {
    fn clone(&self) -> Self {
        if let Some(object) = self.get() {
            object.ref_count().increase();
        }
        Self {
            ptr: self.ptr,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized + RefCounted> Drop for Ref<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: ?Sized + RefCounted> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Some(object) => object,
            None => panic!("dereferenced a null Ref"),
        }
    }
}

impl<T: ?Sized + RefCounted> Default for Ref<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized + RefCounted> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: ?Sized + RefCounted> Eq for Ref<T> {}

impl<T: ?Sized + RefCounted> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.id())
            .field("strong", &self.strong_count())
            .finish()
    }
}

// =============================================================================
// WEAK HANDLE
// =============================================================================

/// Non-owning observer. Never keeps the object alive.
///
/// `is_valid` answers from the registry, so it stays false after the object
/// dies even if its address is handed to an unrelated allocation.
pub struct WeakRef<T: ?Sized + RefCounted> {
    ptr: Option<NonNull<T>>,
    id: Option<ObjectId>,
    registry: Option<Arc<LiveRegistry>>,
}

// SAFETY: the pointer is only dereferenced under the registry lock after a
// liveness check, and `T: Send + Sync`.
unsafe impl<T: ?Sized + RefCounted> Send for WeakRef<T> {}
unsafe impl<T: ?Sized + RefCounted> Sync for WeakRef<T> {}

impl<T: ?Sized + RefCounted> WeakRef<T> {
    pub const fn new() -> Self {
        Self {
            ptr: None,
            id: None,
            registry: None,
        }
    }

    /// Observe an object from its raw identity.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object owned through `Ref` at the time of
    /// the call. After that the weak handle tolerates its destruction.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        let owner = ptr.as_ref().ref_count().owner.get();
        Self {
            ptr: Some(ptr),
            id: owner.map(|owner| owner.id),
            registry: owner.map(|owner| Arc::clone(&owner.registry)),
        }
    }

    pub fn is_valid(&self) -> bool {
        match (self.id, &self.registry) {
            (Some(id), Some(registry)) => registry.is_live(id),
            _ => false,
        }
    }

    /// Take a strong reference if the object is still alive.
    pub fn upgrade(&self) -> Option<Ref<T>> {
        let (ptr, id, registry) = (self.ptr?, self.id?, self.registry.as_ref()?);
        registry
            .with_live(id, || {
                // SAFETY: `id` is registered and we hold the registry lock,
                // so the owner has not freed the object yet.
                let header = unsafe { ptr.as_ref() }.ref_count();
                header.try_increase().then_some(Ref {
                    ptr: Some(ptr),
                    _owns: PhantomData,
                })
            })
            .flatten()
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }
}

impl<T: ?Sized + RefCounted> From<&Ref<T>> for WeakRef<T> {
    fn from(strong: &Ref<T>) -> Self {
        let owner = strong.get().and_then(|object| object.ref_count().owner.get());
        Self {
            ptr: strong.ptr,
            id: owner.map(|owner| owner.id),
            registry: owner.map(|owner| Arc::clone(&owner.registry)),
        }
    }
}

impl<T: ?Sized + RefCounted> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            id: self.id,
            registry: self.registry.clone(),
        }
    }
}

impl<T: ?Sized + RefCounted> Default for WeakRef<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + RefCounted> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
