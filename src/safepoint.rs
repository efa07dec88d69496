//! §4.D Safepoint Page Manager.
//!
//! Owns the one process-wide safepoint page and hands out the per-thread CSP
//! pages thread records are built with (see [`crate::thread_record::ThreadRecord::csp_page`]).
//! Only the STW initiator ever calls [`SafepointPageManager::unmap_safepoint_page`] /
//! [`SafepointPageManager::map_safepoint_page`] (§3: "its state is mutated
//! only by the STW initiator").

use std::sync::Arc;

use crate::platform::{MappedPage, PageAccess, PlatformAdapter, Protection};
use crate::thread_record::ThreadRecord;

pub struct SafepointPageManager {
    page: Box<dyn MappedPage>,
}

impl SafepointPageManager {
    pub fn new(platform: &dyn PlatformAdapter, page_size: usize) -> Self {
        let page = platform
            .new_mapped_page(page_size)
            .unwrap_or_else(|e| crate::error::lose(&format!("failed to map safepoint page: {e}")));
        SafepointPageManager { page }
    }

    /// Store zero to the safepoint page — the mutator-side poll. Faults
    /// (returns [`PageAccess::WouldFault`]) iff the page is currently
    /// unmapped/no-access, which is exactly the rendezvous signal §2
    /// describes.
    pub fn poll(&self) -> PageAccess {
        self.page.store_word(0)
    }

    /// Unmap (no-access) the safepoint page. Only the initiator calls this,
    /// with `mx_gp_unmapped` held.
    pub fn unmap_safepoint_page(&self) {
        self.page
            .protect(Protection::NoAccess)
            .unwrap_or_else(|e| crate::error::lose(&format!("failed to unmap safepoint page: {e}")));
    }

    /// Remap (read-write) the safepoint page, ending the current stop round.
    pub fn map_safepoint_page(&self) {
        self.page
            .protect(Protection::ReadWrite)
            .unwrap_or_else(|e| crate::error::lose(&format!("failed to map safepoint page: {e}")));
    }

    pub fn is_unmapped(&self) -> bool {
        self.page.current_protection() == Protection::NoAccess
    }

    /// §4.D's `set_csp_access`: set `thread`'s CSP page to read-only (when
    /// `writable` is false) or read-write, and return whether its published
    /// CSP was non-zero *before* the call — "enabling the caller to learn in
    /// the same call whether the thread is in foreign code."
    pub fn set_csp_access(&self, thread: &Arc<ThreadRecord>, writable: bool) -> bool {
        let was_in_foreign_code = !thread.is_in_managed_code();
        let prot = if writable {
            Protection::ReadWrite
        } else {
            Protection::ReadOnly
        };
        thread
            .csp_page
            .protect(prot)
            .unwrap_or_else(|e| crate::error::lose(&format!("failed to protect CSP page: {e}")));
        was_in_foreign_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;

    #[test]
    fn unmap_then_poll_faults() {
        let platform = FakePlatform::new();
        let mgr = SafepointPageManager::new(platform.as_ref(), 4096);
        assert!(!mgr.is_unmapped());
        mgr.unmap_safepoint_page();
        assert!(mgr.is_unmapped());
        assert_eq!(mgr.poll(), PageAccess::WouldFault);
        mgr.map_safepoint_page();
        assert_eq!(mgr.poll(), PageAccess::Ok(0));
    }

    #[test]
    fn set_csp_access_reports_prior_foreign_code_state() {
        let platform = FakePlatform::new();
        let handle = crate::thread_record::ThreadHandle {
            index: 0,
            generation: 0,
        };
        let thread = Arc::new(ThreadRecord::new(handle, platform.as_ref(), 4096));
        let mgr = SafepointPageManager::new(platform.as_ref(), 4096);

        assert!(!mgr.set_csp_access(&thread, false));

        thread.csp_page.protect(Protection::ReadWrite).unwrap();
        thread.csp_page.store_word(0xdead_beef);
        assert!(mgr.set_csp_access(&thread, true));
    }
}
