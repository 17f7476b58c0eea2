use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// 带 TTL 和容量上限的异步缓存
#[derive(Clone)]
pub struct CacheService<K, V> {
    cache: Arc<Cache<K, V>>,
}

impl<K, V> CacheService<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// 新建缓存服务
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        CacheService {
            cache: Arc::new(cache),
        }
    }

    /// 获取缓存，如果没有命中则返回 None
    pub async fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key).await
    }

    /// 获取缓存，未命中时调用 loader；只有成功的结果会写入缓存
    pub async fn get_or_try_load<F, Fut, E>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.cache.get(&key).await {
            return Ok(value);
        }
        let value = loader().await?;
        self.cache.insert(key, value.clone()).await;
        Ok(value)
    }

    /// 删除某个 key
    pub async fn invalidate(&self, key: &K) {
        self.cache.invalidate(key).await;
    }
}
