use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct Val {
    veto: AtomicBool,
    closed: AtomicBool,
}

impl CacheValue for Val {
    fn try_close(&self, _ttl: Duration) -> BoxFut<'_, bool> {
        Box::pin(async move {
            if self.veto.load(Ordering::SeqCst) {
                return false;
            }
            self.closed.store(true, Ordering::SeqCst);
            true
        })
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(async move { self.closed.store(true, Ordering::SeqCst) })
    }
}

fn cache() -> ObjectCache<Val> {
    ObjectCache::new(ObjectCacheConfig {
        gc_interval_s: 3600,
        ..Default::default()
    })
}

fn loader(
    count: Arc<AtomicUsize>,
    delay: Duration,
) -> impl FnOnce() -> BoxFut<'static, HeartResult<Arc<Val>>> {
    move || -> BoxFut<'static, HeartResult<Arc<Val>>> {
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(Arc::new(Val::default()))
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_gets_share_one_load() {
    let cache = Arc::new(cache());
    let count = Arc::new(AtomicUsize::new(0));
    let id = ObjectId::from("a");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let count = count.clone();
        let id = id.clone();
        tasks.push(tokio::task::spawn(async move {
            let r = cache
                .get(&id, false, loader(count, Duration::from_millis(50)))
                .await
                .unwrap();
            r.value().clone()
        }));
    }
    let mut values = Vec::new();
    for t in tasks {
        values.push(t.await.unwrap());
    }
    assert_eq!(1, count.load(Ordering::SeqCst));
    assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_loads_are_not_cached() {
    let cache = cache();
    let id = ObjectId::from("a");
    let err = cache
        .get(&id, false, || {
            Box::pin(async { Err(HeartError::not_found("nope")) })
                as BoxFut<'static, HeartResult<Arc<Val>>>
        })
        .await
        .err()
        .unwrap();
    assert!(err.is(ErrorKind::NotFound));
    assert!(cache.is_empty());

    let count = Arc::new(AtomicUsize::new(0));
    cache
        .get(&id, false, loader(count.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(1, count.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_loads_time_out() {
    let cache = ObjectCache::<Val>::new(ObjectCacheConfig {
        load_timeout_s: 0,
        ..Default::default()
    });
    let count = Arc::new(AtomicUsize::new(0));
    let err = cache
        .get(&"a".into(), false, loader(count, Duration::from_secs(5)))
        .await
        .err()
        .unwrap();
    assert!(err.is(ErrorKind::Canceled));
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn gc_closes_unreferenced_entries_unless_vetoed() {
    let cache = ObjectCache::<Val>::new(ObjectCacheConfig {
        ttl_s: 0,
        gc_interval_s: 3600,
        ..Default::default()
    });
    let count = Arc::new(AtomicUsize::new(0));

    let held = cache
        .get(&"held".into(), false, loader(count.clone(), Duration::ZERO))
        .await
        .unwrap();
    let vetoing = cache
        .get(&"veto".into(), false, loader(count.clone(), Duration::ZERO))
        .await
        .unwrap();
    vetoing.veto.store(true, Ordering::SeqCst);
    drop(vetoing);
    let free = cache
        .get(&"free".into(), false, loader(count.clone(), Duration::ZERO))
        .await
        .unwrap()
        .value()
        .clone();

    cache.gc().await;
    let mut ids = cache.ready_ids();
    ids.sort();
    assert_eq!(vec![ObjectId::from("held"), ObjectId::from("veto")], ids);
    assert!(free.closed.load(Ordering::SeqCst));
    assert!(!held.closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn reservations_and_removal() {
    let cache = cache();
    let id = ObjectId::from("a");

    let res = cache
        .do_locked_if_not_exists(&id, async { Ok(5) })
        .await
        .unwrap();
    assert_eq!(5, res);
    assert!(cache.is_empty());

    let r = cache.add(&id, Arc::new(Val::default())).unwrap();
    assert!(matches!(
        cache.add(&id, Arc::new(Val::default())),
        Err(HeartError::ExistsInCache(_))
    ));
    assert!(matches!(
        cache.do_locked_if_not_exists(&id, async { Ok(()) }).await,
        Err(HeartError::ExistsInCache(_))
    ));

    assert!(cache
        .remove(&id, false)
        .await
        .unwrap_err()
        .is(ErrorKind::Restricted));
    let value = r.value().clone();
    assert!(cache.remove(&id, true).await.unwrap());
    assert!(value.closed.load(Ordering::SeqCst));
    assert!(!cache.remove(&id, false).await.unwrap());
    drop(r);
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn close_all_closes_everything() {
    let cache = cache();
    let count = Arc::new(AtomicUsize::new(0));
    let a = cache
        .get(&"a".into(), false, loader(count.clone(), Duration::ZERO))
        .await
        .unwrap()
        .value()
        .clone();
    cache.close_all().await;
    assert!(a.closed.load(Ordering::SeqCst));
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_from_a_spawned_task() {
    let cache = Arc::new(cache());
    let id = ObjectId::from("a");
    let value = Arc::new(Val::default());
    drop(cache.add(&id, value.clone()).unwrap());

    let task = tokio::task::spawn({
        let cache = cache.clone();
        let id = id.clone();
        async move { cache.remove(&id, false).await }
    });
    assert!(task.await.unwrap().unwrap());
    assert!(value.closed.load(Ordering::SeqCst));
    assert!(cache.is_empty());

    let task = tokio::task::spawn({
        let cache = cache.clone();
        async move { cache.close_all().await }
    });
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn close_all_waits_for_loads_in_flight() {
    let cache = Arc::new(cache());
    let count = Arc::new(AtomicUsize::new(0));

    let pending = tokio::task::spawn({
        let cache = cache.clone();
        let count = count.clone();
        async move {
            cache
                .get(&"slow".into(), false, loader(count, Duration::from_millis(200)))
                .await
                .map(|r| r.value().clone())
        }
    });
    while count.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cache.close_all().await;
    assert!(cache.is_empty());

    match pending.await.unwrap() {
        Ok(loaded) => assert!(loaded.closed.load(Ordering::SeqCst)),
        Err(err) => assert!(err.is(ErrorKind::NotFound)),
    }
    assert_eq!(1, count.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.is_empty());
}
