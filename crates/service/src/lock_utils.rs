use std::sync::{LockResult, RwLock, RwLockReadGuard, RwLockWriteGuard};

// 中文注释：锁中毒时继续服务（into_inner），并用稳定的锁名打 warn 日志，方便按 lock= 检索。
fn recover<G>(result: LockResult<G>, name: &str, action: &str) -> G {
    result.unwrap_or_else(|poisoned| {
        log::warn!("event=lock_poisoned lock={} action={}", name, action);
        poisoned.into_inner()
    })
}

pub(crate) fn read_recover<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), name, "recover_read")
}

pub(crate) fn write_recover<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), name, "recover_write")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn poisoned_rwlock_is_recovered_with_last_value() {
        let lock = Arc::new(RwLock::new(1));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let mut guard = poisoner.write().expect("write");
            *guard = 2;
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        assert_eq!(*read_recover(&lock, "test_rwlock"), 2);
        *write_recover(&lock, "test_rwlock") = 3;
        assert_eq!(*read_recover(&lock, "test_rwlock"), 3);
    }
}
