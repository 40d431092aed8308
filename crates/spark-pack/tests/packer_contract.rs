//! `packer_contract` 集成测试：验证分段链式序列化的正确性与失败清理。
//!
//! # 测试目标（Why）
//! - 任意初始容量下，分段链合并后的字节流与一次性写入大缓冲的结果完全一致；
//! - 链为空时走快速路径，结果直接复用活动区域，不发生额外分配；
//! - 任意一步失败（协作者报错、分段申请失败、合并目标申请失败）之后，
//!   所有分段都归还分配器，调用方的目标缓冲保持不变。
//!
//! # 测试结构（How）
//! - `RecordingAllocator` 包装堆分配，记录每次申请与归还，并可按条件注入失败；
//! - `outstanding()` 为零即代表没有区域泄漏；
//! - 以 `Arc` 注入时分配器兼作结果缓冲的归还句柄，结果缓冲在 `Drop` 时归还。

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use spark_pack::{
    AllocError, Buffer, HeapAllocator, Pack, Packer, PackerConfig, SegmentAllocator, SegmentPool,
    SerializeError, Serializer, SerializerConfig, Value,
};

/// 记录申请与归还的分配器。
///
/// - `fail_after`：成功申请这么多次之后，后续申请全部失败；
/// - `max_request`：单次申请超过该容量时失败。
#[derive(Default)]
struct RecordingAllocator {
    allocations: AtomicUsize,
    reclaims: AtomicUsize,
    detaches: AtomicUsize,
    requests: Mutex<Vec<usize>>,
    fail_after: Option<usize>,
    max_request: Option<usize>,
}

impl RecordingAllocator {
    fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::default()
        }
    }

    fn limited_to(max_request: usize) -> Self {
        Self {
            max_request: Some(max_request),
            ..Self::default()
        }
    }

    fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    fn outstanding(&self) -> usize {
        self.allocations()
            - self.reclaims.load(Ordering::SeqCst)
            - self.detaches.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<usize> {
        self.requests.lock().expect("记录锁中毒").clone()
    }
}

impl SegmentAllocator for RecordingAllocator {
    fn allocate(&self, capacity: usize) -> Result<Vec<u8>, AllocError> {
        self.requests.lock().expect("记录锁中毒").push(capacity);
        let exhausted = self
            .fail_after
            .is_some_and(|limit| self.allocations() >= limit);
        let too_large = self.max_request.is_some_and(|limit| capacity > limit);
        if exhausted || too_large {
            return Err(AllocError::OutOfMemory {
                requested: capacity,
            });
        }
        let region = HeapAllocator.allocate(capacity)?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(region)
    }

    fn reclaim(&self, region: Vec<u8>) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
        drop(region);
    }

    fn detach(&self, _capacity: usize) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

fn config_with_capacity(capacity: usize) -> SerializerConfig {
    SerializerConfig::default().with_packer(PackerConfig::default().with_initial_capacity(capacity))
}

fn sample_record() -> Value {
    let bins: Value = (0..40)
        .map(|i| {
            (
                Value::from(format!("bin-{i}")),
                Value::from(vec![i as u8; (i as usize) * 3]),
            )
        })
        .collect();
    Value::List(vec![
        Value::from("namespace"),
        Value::Integer(-1_000_000),
        Value::Double(0.25),
        bins,
        Value::Nil,
    ])
}

/// 协作者写入一段数据后声明失败。
struct FailsAfter(usize);

impl Pack for FailsAfter {
    fn pack(&self, packer: &mut Packer<'_>) -> Result<(), SerializeError> {
        packer.write(&vec![0xab; self.0])?;
        Err(SerializeError::encode("unsupported particle type"))
    }
}

/// 不写入任何字节的协作者。
struct Nothing;

impl Pack for Nothing {
    fn pack(&self, _packer: &mut Packer<'_>) -> Result<(), SerializeError> {
        Ok(())
    }
}

/// 小容量分段链的合并结果必须与单一大缓冲逐字节相同。
#[test]
fn chained_output_matches_single_region_output() {
    let value = sample_record();
    let reference = Serializer::with_allocator(HeapAllocator, config_with_capacity(1 << 20))
        .expect("配置应合法")
        .serialize(&value)
        .expect("编码失败");

    for capacity in [1usize, 2, 7, 10, 64, 255] {
        let recorder = Arc::new(RecordingAllocator::default());
        let serializer =
            Serializer::with_allocator(Arc::clone(&recorder), config_with_capacity(capacity))
                .expect("配置应合法");
        let buffer = serializer.serialize(&value).expect("编码失败");
        assert_eq!(
            buffer.as_slice(),
            reference.as_slice(),
            "容量 {capacity} 下分段链输出不一致"
        );
        assert_eq!(buffer.size(), reference.size());
        assert_eq!(recorder.outstanding(), 1, "只有结果缓冲仍在外部");
        serializer.recycle(buffer);
        assert_eq!(recorder.outstanding(), 0);
    }
}

/// 合并目标的容量恰好等于总长度，且所有分段都已归还。
#[test]
fn consolidation_requests_exact_total() {
    let recorder = RecordingAllocator::default();
    let serializer =
        Serializer::with_allocator(&recorder, config_with_capacity(10)).expect("配置应合法");
    let payload: Vec<u8> = (0..=255u8).collect();
    let buffer = serializer
        .serialize(&Value::Bytes(payload.clone()))
        .expect("编码失败");

    // bin16 头部 3 字节 + 256 字节负载。
    assert_eq!(buffer.size(), 259);
    assert_eq!(&buffer[3..], payload.as_slice());
    let requests = recorder.requests();
    assert_eq!(requests.last(), Some(&259), "最后一次申请应为合并目标");
    assert!(requests[..requests.len() - 1].iter().all(|&n| n == 10));
    assert_eq!(recorder.outstanding(), 1);
}

/// 链为空时结果直接是活动区域：只申请一次，且容量保留为初始容量。
#[test]
fn single_segment_takes_the_fast_path() {
    let recorder = RecordingAllocator::default();
    let serializer =
        Serializer::with_allocator(&recorder, config_with_capacity(128)).expect("配置应合法");
    let buffer = serializer.serialize(&Value::from("hello")).expect("编码失败");

    assert_eq!(buffer.as_slice(), b"\xa5hello");
    assert_eq!(recorder.allocations(), 1);
    assert!(buffer.capacity() >= 128);
    assert_eq!(recorder.outstanding(), 1);
}

/// 写入恰好填满初始区域时不触发换段。
#[test]
fn exact_fill_does_not_rotate() {
    let recorder = RecordingAllocator::default();
    let mut packer = Packer::new(&recorder, 4).expect("创建 Packer 失败");
    packer.write(b"abcd").expect("写入失败");
    assert_eq!(packer.segment_count(), 0);
    packer.write_u8(b'e').expect("写入失败");
    assert_eq!(packer.segment_count(), 1);
    let buffer = packer.finish().expect("finish 失败");
    assert_eq!(buffer.as_slice(), b"abcde");
    assert_eq!(recorder.outstanding(), 1);
}

/// 协作者中途失败：全部分段归还，目标缓冲保持原样。
#[test]
fn encode_failure_releases_every_segment() {
    let recorder = RecordingAllocator::default();
    let serializer =
        Serializer::with_allocator(&recorder, config_with_capacity(16)).expect("配置应合法");
    let mut dst = Buffer::from(&b"previous"[..]);

    let err = serializer
        .serialize_into(&FailsAfter(100), &mut dst)
        .expect_err("协作者失败必须传播");

    assert_eq!(err, SerializeError::encode("unsupported particle type"));
    assert!(!err.is_recoverable());
    assert!(recorder.allocations() > 1, "失败前应已构建分段链");
    assert_eq!(recorder.outstanding(), 0, "失败后不得遗留任何分段");
    assert_eq!(dst.as_slice(), b"previous");
}

/// 换段时的分配失败同样触发完整清理。
#[test]
fn segment_allocation_failure_is_cleaned_up() {
    let recorder = RecordingAllocator::failing_after(3);
    let serializer =
        Serializer::with_allocator(&recorder, config_with_capacity(8)).expect("配置应合法");

    let err = serializer
        .serialize(&Value::Bytes(vec![1; 64]))
        .expect_err("第四次申请必须失败");

    assert_eq!(err, SerializeError::Alloc(AllocError::OutOfMemory { requested: 8 }));
    assert_eq!(err.code(), spark_pack::error::codes::OUT_OF_MEMORY);
    assert!(err.is_recoverable());
    assert_eq!(recorder.allocations(), 3);
    assert_eq!(recorder.outstanding(), 0);
}

/// 合并目标申请失败：分段在 Packer 丢弃时全部归还。
#[test]
fn consolidation_failure_is_cleaned_up() {
    let recorder = RecordingAllocator::limited_to(64);
    let serializer =
        Serializer::with_allocator(&recorder, config_with_capacity(8)).expect("配置应合法");
    let mut dst = Buffer::new();

    let err = serializer
        .serialize_into(&Value::Bytes(vec![7; 100]), &mut dst)
        .expect_err("合并目标超过上限必须失败");

    assert_eq!(
        err,
        SerializeError::Alloc(AllocError::OutOfMemory { requested: 102 })
    );
    assert_eq!(recorder.outstanding(), 0);
    assert!(dst.is_empty());
}

/// 初始区域就申请失败时没有任何区域被持有。
#[test]
fn initial_allocation_failure_returns_error() {
    let recorder = RecordingAllocator::failing_after(0);
    let serializer = Serializer::with_allocator(&recorder, SerializerConfig::default())
        .expect("配置应合法");
    let err = serializer.serialize(&Value::Nil).expect_err("必须失败");
    assert!(matches!(err, SerializeError::Alloc(_)));
    assert_eq!(recorder.outstanding(), 0);
}

/// 未写入任何字节时得到长度为 0 的缓冲。
#[test]
fn empty_output_yields_zero_sized_buffer() {
    let recorder = RecordingAllocator::default();
    let serializer =
        Serializer::with_allocator(&recorder, config_with_capacity(32)).expect("配置应合法");
    let buffer = serializer.serialize(&Nothing).expect("编码失败");
    assert_eq!(buffer.size(), 0);
    assert!(buffer.is_empty());
    assert_eq!(serializer.serialized_size(&Nothing), Ok(0));
}

/// 直接使用 Packer 时，丢弃未完成的 Packer 也会归还全部分段。
#[test]
fn dropping_packer_releases_regions() {
    let recorder = RecordingAllocator::default();
    {
        let mut packer = Packer::new(&recorder, 3).expect("创建 Packer 失败");
        packer.write(&[0u8; 20]).expect("写入失败");
        assert_eq!(packer.segment_count(), 6);
        assert_eq!(packer.len(), 20);
    }
    assert_eq!(recorder.outstanding(), 0);
}

#[test]
fn abort_cleanup_releases_regions() {
    let recorder = RecordingAllocator::default();
    let mut packer = Packer::new(&recorder, 5).expect("创建 Packer 失败");
    packer.write(&[1u8; 12]).expect("写入失败");
    packer.abort_cleanup();
    assert_eq!(recorder.outstanding(), 0);
}

/// 通过 `recycle` 把结果缓冲交还池后，下一次编码复用同一区域。
#[test]
fn pool_reuses_recycled_regions() {
    let pool = SegmentPool::new();
    let serializer =
        Serializer::with_allocator(pool.clone(), config_with_capacity(64)).expect("配置应合法");

    let first = serializer.serialize(&sample_record()).expect("编码失败");
    let after_first = pool.statistics();
    assert_eq!(after_first.active_leases, 1, "只有结果缓冲仍被租借");
    assert!(after_first.free_regions > 0, "分段应已回到自由链表");

    serializer.recycle(first);
    let second = serializer.serialize(&Value::from("small")).expect("编码失败");
    let stats = pool.statistics();
    assert!(stats.reused_regions >= 1, "第二次编码应命中自由链表");
    assert_eq!(stats.active_leases, 1);
    assert_eq!(stats.failed_acquisitions, 0);

    serializer.recycle(second);
    assert_eq!(pool.statistics().active_leases, 0);
    assert!(pool.shrink_to_fit() > 0);
    assert_eq!(pool.statistics().available_bytes, 0);
}

/// 测量结果与实际编码长度一致，且测量不触碰分配器。
#[test]
fn measuring_does_not_allocate() {
    let recorder = RecordingAllocator::default();
    let serializer =
        Serializer::with_allocator(&recorder, config_with_capacity(16)).expect("配置应合法");
    let value = sample_record();
    let size = serializer.serialized_size(&value).expect("测量失败");
    assert_eq!(recorder.allocations(), 0);
    assert_eq!(serializer.serialize(&value).expect("编码失败").size(), size);
}

/// 结果缓冲经 `into_bytes` 交给传输层后被释放，池的租约与持有量随之回落。
#[test]
fn pooled_results_return_to_pool_when_dropped() {
    let pool = SegmentPool::new();
    let serializer =
        Serializer::with_allocator(pool.clone(), config_with_capacity(64)).expect("配置应合法");

    for _ in 0..5 {
        let bytes = serializer
            .serialize(&Value::from("hello"))
            .expect("编码失败")
            .into_bytes();
        assert_eq!(&bytes[..], b"\xa5hello");
        drop(bytes);
    }
    let bytes = serializer
        .serialize(&sample_record())
        .expect("编码失败")
        .into_bytes();
    let view = bytes.slice(1..16);
    drop(bytes);
    assert_eq!(pool.statistics().active_leases, 1, "仍有视图存活时租约不能结束");
    drop(view);

    let stats = pool.statistics();
    assert_eq!(stats.active_leases, 0);
    assert_eq!(stats.allocated_bytes, stats.available_bytes);
}

/// 外来缓冲交给 `recycle` 时不会混入池的自由链表。
#[test]
fn foreign_buffers_are_not_adopted() {
    let pool = SegmentPool::new();
    let serializer =
        Serializer::with_allocator(pool.clone(), config_with_capacity(64)).expect("配置应合法");
    serializer.recycle(serializer.serialize(&Value::from(1)).expect("编码失败"));
    let before = pool.statistics();

    serializer.recycle(Buffer::from(vec![0u8; 4096]));
    let leased = serializer.serialize(&Value::Nil).expect("编码失败");
    serializer.recycle(leased.clone());

    let after = pool.statistics();
    assert_eq!(after.free_regions, 0, "唯一的空闲区域已被重新租出，外来区域未入链");
    assert_eq!(after.available_bytes, 0);
    assert_eq!(after.active_leases, 1);
    drop(leased);
    let settled = pool.statistics();
    assert_eq!(settled.active_leases, 0);
    assert_eq!(settled.available_bytes, before.available_bytes);
    assert_eq!(settled.allocated_bytes, settled.available_bytes);
}

/// `into_vec` 永久取走区域：租约结束，池不再把它计入持有量。
#[test]
fn into_vec_detaches_from_pool() {
    let pool = SegmentPool::new();
    let serializer =
        Serializer::with_allocator(pool.clone(), config_with_capacity(64)).expect("配置应合法");
    let region = serializer
        .serialize(&Value::from("owned"))
        .expect("编码失败")
        .into_vec();
    assert_eq!(region.as_slice(), b"\xa5owned");

    let stats = pool.statistics();
    assert_eq!(stats.active_leases, 0);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.available_bytes, 0);
}

/// 以 `Arc` 注入的记录分配器同样在结果缓冲丢弃时收到归还。
#[test]
fn shared_allocator_receives_dropped_results() {
    let recorder = Arc::new(RecordingAllocator::default());
    let serializer = Serializer::with_allocator(Arc::clone(&recorder), config_with_capacity(8))
        .expect("配置应合法");
    let buffer = serializer.serialize(&sample_record()).expect("编码失败");
    assert!(buffer.is_leased());
    assert_eq!(recorder.outstanding(), 1);
    drop(buffer);
    assert_eq!(recorder.outstanding(), 0);

    let kept = serializer
        .serialize(&Value::from("kept"))
        .expect("编码失败")
        .into_vec();
    assert_eq!(kept.len(), 5);
    assert_eq!(recorder.outstanding(), 0, "into_vec 应结束租约");
}
