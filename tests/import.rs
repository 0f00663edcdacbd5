use std::{fs::File, io::Write, os::unix::io::OwnedFd, rc::Rc};

use kiln::{
    backend::{
        allocator::{
            dmabuf::{Dmabuf, DmabufFlags},
            shm::{ShmBuffer, ShmPool},
            Fourcc, Modifier,
        },
        renderer::{
            headless::{HeadlessConfig, HeadlessError, HeadlessRenderer},
            import::{import_buffer, ClientBuffer, ImportError, ImportedBuffer},
            Renderer, RendererError, ShaderVariant, Texture,
        },
    },
    utils::{Rectangle, Region, Size},
};
use rustix::{
    event::{eventfd, EventfdFlags},
    fs::{memfd_create, MemfdFlags},
};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memfd(data: &[u8]) -> OwnedFd {
    let fd = memfd_create("kiln-import", MemfdFlags::CLOEXEC).unwrap();
    let mut file = File::from(fd);
    file.write_all(data).unwrap();
    OwnedFd::from(file)
}

/// 64x64 NV12 image: a luma plane followed by an interleaved chroma plane
fn nv12_data(y: u8, u: u8, v: u8) -> Vec<u8> {
    let mut data = vec![y; 64 * 64];
    for _ in 0..32 * 32 {
        data.extend_from_slice(&[u, v]);
    }
    data
}

fn nv12_shm(y: u8, u: u8, v: u8) -> ShmBuffer {
    let data = nv12_data(y, u, v);
    let pool = ShmPool::create("nv12", data.len()).unwrap();
    pool.with_data_mut(|memory| memory.copy_from_slice(&data));
    ShmBuffer::new(&pool, 0, (64, 64), 64, Fourcc::Nv12)
}

fn nv12_dmabuf(modifier: Modifier) -> Dmabuf {
    let data = nv12_data(128, 100, 150);
    let (luma, chroma) = data.split_at(64 * 64);
    let mut builder = Dmabuf::builder((64, 64), Fourcc::Nv12, DmabufFlags::empty());
    builder.add_plane(memfd(luma), 0, 0, 64, modifier);
    builder.add_plane(memfd(chroma), 1, 0, 64, modifier);
    builder.build().unwrap()
}

#[test]
fn nv12_is_split_into_luma_and_chroma() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let buffer = ClientBuffer::shm(nv12_shm(128, 100, 150));

    let imported = import_buffer(&mut renderer, &buffer, None).unwrap();
    assert_eq!(imported.variant(), ShaderVariant::Y_UV);
    assert_eq!(imported.planes().len(), 2);

    let luma = &imported.planes()[0];
    assert_eq!(luma.bind_plane().format, Fourcc::R8);
    assert_eq!(luma.texture().size(), Size::from((64, 64)));

    let chroma = &imported.planes()[1];
    assert_eq!(chroma.bind_plane().format, Fourcc::Gr88);
    assert_eq!((chroma.bind_plane().hsub, chroma.bind_plane().vsub), (2, 2));
    assert_eq!(chroma.texture().size(), Size::from((32, 32)));
    assert_eq!(chroma.upload_offset(), 64 * 64);
    assert_eq!(renderer.live_textures(), 2);
}

#[test]
fn shm_and_dmabuf_decompose_alike() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let shm = ClientBuffer::shm(nv12_shm(128, 100, 150));
    let dmabuf = ClientBuffer::dmabuf(nv12_dmabuf(Modifier::Linear));

    let shm = import_buffer(&mut renderer, &shm, None).unwrap();
    let dmabuf = import_buffer(&mut renderer, &dmabuf, None).unwrap();

    assert_eq!(shm.variant(), dmabuf.variant());
    let formats = |imported: &ImportedBuffer<HeadlessRenderer>| {
        imported
            .planes()
            .iter()
            .map(|plane| (plane.bind_plane().format, plane.texture().size()))
            .collect::<Vec<_>>()
    };
    assert_eq!(formats(&shm), formats(&dmabuf));
    assert!(dmabuf.planes().iter().all(|plane| plane.texture().is_mapped()));
}

#[test]
fn unchanged_buffers_are_not_imported_twice() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let buffer = ClientBuffer::shm(nv12_shm(16, 128, 128));

    let first = import_buffer(&mut renderer, &buffer, None).unwrap();
    let updates = renderer.sampler_updates();

    let second = import_buffer(&mut renderer, &buffer, Some(&Region::new())).unwrap();
    assert!(Rc::ptr_eq(&first, &second));

    let damage = Region::from_rect(Rectangle::from_loc_and_size((0, 0), (8, 8)));
    let third = import_buffer(&mut renderer, &buffer, Some(&damage)).unwrap();
    assert!(Rc::ptr_eq(&first, &third));

    assert_eq!(renderer.sampler_updates(), updates);
    assert_eq!(renderer.live_textures(), 2);
}

#[test]
fn textures_live_as_long_as_the_buffer() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let buffer = ClientBuffer::shm(nv12_shm(16, 128, 128));
    let imported = import_buffer(&mut renderer, &buffer, None).unwrap();
    assert_eq!(renderer.live_textures(), 2);

    drop(buffer);
    assert_eq!(renderer.live_textures(), 2);
    drop(imported);
    assert_eq!(renderer.live_textures(), 0);
}

#[test]
fn memory_mismatch_releases_imported_planes() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());

    // the chroma plane lives in memory the device cannot map
    let mut builder = Dmabuf::builder((64, 64), Fourcc::Nv12, DmabufFlags::empty());
    builder.add_plane(memfd(&[0x80; 64 * 64]), 0, 0, 64, Modifier::Linear);
    builder.add_plane(eventfd(0, EventfdFlags::CLOEXEC).unwrap(), 1, 0, 64, Modifier::Linear);
    let buffer = ClientBuffer::dmabuf(builder.build().unwrap());

    let result = import_buffer(&mut renderer, &buffer, None);
    assert!(matches!(
        result,
        Err(ImportError::Renderer(HeadlessError::MemoryTypeMismatch))
    ));
    assert_eq!(renderer.live_textures(), 0);
    assert!(!buffer.is_imported(renderer.id()));
}

#[test]
fn unknown_formats_are_rejected_early() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let pool = ShmPool::create("c8", 16).unwrap();
    let buffer = ClientBuffer::shm(ShmBuffer::new(&pool, 0, (4, 4), 4, Fourcc::C8));

    let result = import_buffer(&mut renderer, &buffer, None);
    assert!(matches!(result, Err(ImportError::UnsupportedFormat(Fourcc::C8))));
    assert_eq!(renderer.sampler_updates(), 0);
}

#[test]
fn unadvertised_modifiers_are_rejected() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let buffer = ClientBuffer::dmabuf(nv12_dmabuf(Modifier::I915_x_tiled));

    let result = import_buffer(&mut renderer, &buffer, None);
    assert!(matches!(
        result,
        Err(ImportError::UnsupportedModifier(Fourcc::Nv12, Modifier::I915_x_tiled))
    ));
    assert_eq!(renderer.live_textures(), 0);
}

#[test]
fn short_strides_are_rejected() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let pool = ShmPool::create("argb", 16 * 16 * 4).unwrap();
    let buffer = ClientBuffer::shm(ShmBuffer::new(&pool, 0, (16, 16), 32, Fourcc::Argb8888));

    let result = import_buffer(&mut renderer, &buffer, None);
    assert!(matches!(result, Err(ImportError::InvalidGeometry(_))));
    assert_eq!(renderer.sampler_updates(), 0);
}

#[test]
fn exhaustion_declines_the_import() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig {
        texture_budget: Some(1),
        ..Default::default()
    });
    let buffer = ClientBuffer::shm(nv12_shm(16, 128, 128));

    for _ in 0..2 {
        match import_buffer(&mut renderer, &buffer, None) {
            Err(ImportError::Renderer(err)) => assert!(err.is_resource_exhaustion()),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }
    assert_eq!(renderer.live_textures(), 0);
}

#[test]
fn native_yuv_devices_sample_dmabufs_externally() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig {
        native_yuv: true,
        ..Default::default()
    });
    let buffer = ClientBuffer::dmabuf(nv12_dmabuf(Modifier::Linear));

    let imported = import_buffer(&mut renderer, &buffer, None).unwrap();
    assert_eq!(imported.variant(), ShaderVariant::External);
    assert_eq!(imported.planes().len(), 1);
    assert!(imported.planes()[0].texture().is_external());
}
