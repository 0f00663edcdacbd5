use std::{
    cell::{Cell, RefCell},
    fs::File,
    io::Write,
    os::unix::{fs::FileExt, io::OwnedFd},
    rc::Rc,
    time::Duration,
};

use kiln::{
    backend::{
        allocator::{
            dmabuf::{Dmabuf, DmabufFlags},
            shm::{ShmBuffer, ShmPool},
            Fourcc, Modifier,
        },
        renderer::{
            capture::{CaptureError, CaptureSource},
            color::Color32F,
            damage::{BorderSide, ExternalTarget, OutputRenderer, RenderTarget, RepaintError},
            headless::{HeadlessConfig, HeadlessRenderer, HeadlessSurface},
            import::ClientBuffer,
            surface::{Attach, RenderSurface, SurfaceState},
            sync::{FdFence, FenceHandle},
            DebugFlags, Renderer,
        },
        SwapBuffersError,
    },
    output::{BorderWidths, Mode, Output, OutputConfig},
    utils::{Buffer, Physical, Rectangle, Region, Size},
};
use rustix::fs::{memfd_create, MemfdFlags};
use tracing_subscriber::EnvFilter;

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn mode(w: i32, h: i32) -> Mode {
    Mode {
        size: (w, h).into(),
        refresh: 60_000,
    }
}

fn output(w: i32, h: i32) -> Output {
    Output::new(OutputConfig::new("test", mode(w, h)))
}

/// Shm buffer filled with one 32 bit texel
fn solid(w: i32, h: i32, format: Fourcc, texel: [u8; 4]) -> ShmBuffer {
    let pool = ShmPool::create("solid", (w * h * 4) as usize).unwrap();
    pool.with_data_mut(|memory| {
        for chunk in memory.chunks_exact_mut(4) {
            chunk.copy_from_slice(&texel);
        }
    });
    ShmBuffer::new(&pool, 0, (w, h), (w * 4) as usize, format)
}

fn red(w: i32, h: i32) -> ShmBuffer {
    // little endian xrgb
    solid(w, h, Fourcc::Xrgb8888, [0, 0, 255, 255])
}

fn attach(state: &mut SurfaceState, buffer: ShmBuffer) {
    state.commit(Some(Attach::new(ClientBuffer::shm(buffer))), []);
}

fn damage_buffer(state: &mut SurfaceState, rect: Rectangle<i32, Buffer>) {
    state.commit(None, [rect]);
}

fn area(damage: &Option<Vec<Rectangle<i32, Physical>>>) -> i64 {
    Region::from_rects(damage.clone().unwrap_or_default()).area()
}

fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Buffer> {
    Rectangle::from_loc_and_size((x, y), (w, h))
}

#[test]
fn surfaces_are_drawn_where_they_are_placed() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = output(64, 64);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let mut state = SurfaceState::new();
    attach(&mut state, red(16, 16));
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_loc_and_size((8, 8), (16, 16)))];

    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
        .unwrap();
    assert!(result.protocol_errors.is_empty());
    assert_eq!(area(&result.damage), 64 * 64);

    let front = window.front_buffer().unwrap();
    assert_eq!(front.pixel(8, 8), Some(RED));
    assert_eq!(front.pixel(23, 23), Some(RED));
    assert_eq!(front.pixel(7, 8), Some(BLACK));
    assert_eq!(front.pixel(24, 24), Some(BLACK));
}

#[test]
fn only_damage_is_repainted() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = output(64, 64);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let mut state = SurfaceState::new();
    attach(&mut state, red(32, 32));

    for _ in 0..2 {
        let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_loc_and_size((8, 8), (32, 32)))];
        let result = output_renderer
            .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
            .unwrap();
        assert_eq!(area(&result.damage), 64 * 64);
    }

    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_loc_and_size((8, 8), (32, 32)))];
    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
        .unwrap();
    assert!(result.is_skipped());
    assert_eq!(window.presented(), 2);

    damage_buffer(&mut state, rect(0, 0, 4, 4));
    let draws = renderer.draw_calls();
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_loc_and_size((8, 8), (32, 32)))];
    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
        .unwrap();
    let expected = vec![Rectangle::<i32, Physical>::from_loc_and_size((8, 8), (4, 4))];
    assert_eq!(result.damage.as_ref(), Some(&expected));
    assert_eq!(window.last_damage(), Some(&expected[..]));
    assert_eq!(renderer.draw_calls(), draws + 1);
}

#[test]
fn hidden_surfaces_are_skipped() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = output(64, 64);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let mut state = SurfaceState::new();
    attach(&mut state, red(16, 16));
    let visible = Region::from_rect(Rectangle::from_loc_and_size((100, 100), (4, 4)));
    let mut surfaces = [
        RenderSurface::new(&mut state, Rectangle::from_loc_and_size((8, 8), (16, 16))).with_visible(visible)
    ];

    output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
        .unwrap();
    assert_eq!(renderer.draw_calls(), 0);
    assert_eq!(renderer.live_textures(), 0);
    assert_eq!(window.front_buffer().unwrap().pixel(8, 8), Some(BLACK));
}

#[test]
fn declared_opaque_regions_replace_content() {
    init_logging();
    let transparent = || solid(16, 16, Fourcc::Argb8888, [0, 0, 0, 0]);

    for (opaque, expected) in [(true, BLACK), (false, RED)] {
        let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
        let output = output(32, 32);
        let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
        let mut output_renderer = OutputRenderer::new(output);

        let mut background = SurfaceState::new();
        attach(&mut background, red(32, 32));
        let mut overlay = SurfaceState::new();
        attach(&mut overlay, transparent());

        let mut top = RenderSurface::new(&mut overlay, Rectangle::from_loc_and_size((0, 0), (16, 16)));
        if opaque {
            top = top.with_opaque(Region::from_rect(Rectangle::from_loc_and_size((0, 0), (16, 16))));
        }
        let mut surfaces = [
            RenderSurface::new(&mut background, Rectangle::from_loc_and_size((0, 0), (32, 32))),
            top,
        ];

        output_renderer
            .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
            .unwrap();
        let front = window.front_buffer().unwrap();
        assert_eq!(front.pixel(4, 4), Some(expected), "opaque: {}", opaque);
        assert_eq!(front.pixel(20, 20), Some(RED));
    }
}

fn client_target(w: i32, h: i32) -> ShmBuffer {
    solid(w, h, Fourcc::Xrgb8888, [0; 4])
}

/// Color bytes of an xrgb client target
fn texel(target: &ShmBuffer, x: usize, y: usize) -> [u8; 3] {
    target
        .with_plane(0, |data, stride| {
            let offset = y * stride + x * 4;
            [data[offset], data[offset + 1], data[offset + 2]]
        })
        .unwrap()
}

/// Render three partial updates and return the union of their damage, and the damage
/// of rendering the same updates at once
fn damage_of_updates(updates: &[Rectangle<i32, Buffer>]) -> (Region<Physical>, Region<Physical>) {
    let mut results = Vec::new();
    for batched in [false, true] {
        let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
        let mut output_renderer = OutputRenderer::new(output(64, 64));
        let target = output_renderer
            .add_client_target(&mut renderer, client_target(64, 64), || {})
            .unwrap();

        let mut state = SurfaceState::new();
        attach(&mut state, red(32, 32));
        let geometry = Rectangle::from_loc_and_size((16, 16), (32, 32));
        let mut surfaces = [RenderSurface::new(&mut state, geometry)];
        output_renderer
            .render_output(&mut renderer, RenderTarget::Buffer(target), &mut surfaces)
            .unwrap();

        let mut union = Region::new();
        for update in updates {
            damage_buffer(&mut state, *update);
            if !batched {
                let mut surfaces = [RenderSurface::new(&mut state, geometry)];
                let result = output_renderer
                    .render_output(&mut renderer, RenderTarget::Buffer(target), &mut surfaces)
                    .unwrap();
                for rect in result.damage.unwrap_or_default() {
                    union.union_rect(rect);
                }
            }
        }
        if batched {
            let mut surfaces = [RenderSurface::new(&mut state, geometry)];
            let result = output_renderer
                .render_output(&mut renderer, RenderTarget::Buffer(target), &mut surfaces)
                .unwrap();
            union = Region::from_rects(result.damage.unwrap_or_default());
        }
        results.push(union);
    }
    let batched = results.pop().unwrap();
    (results.pop().unwrap(), batched)
}

#[test]
fn damage_of_partial_updates_adds_up() {
    init_logging();
    let (separate, batched) = damage_of_updates(&[rect(0, 0, 4, 4), rect(10, 10, 8, 2), rect(2, 2, 4, 4)]);
    assert_eq!(separate.area(), batched.area());
    assert_eq!(batched.area(), 16 + 16 + 16 - 4);
    assert!(batched.rects().iter().all(|rect| separate.contains_rect(*rect)));
    assert!(separate.rects().iter().all(|rect| batched.contains_rect(*rect)));
}

#[test]
fn client_targets_receive_the_content() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let mut output_renderer = OutputRenderer::new(output(32, 32));
    let target = client_target(32, 32);
    let id = output_renderer
        .add_client_target(&mut renderer, target.clone(), || {})
        .unwrap();

    let mut state = SurfaceState::new();
    attach(&mut state, red(8, 8));
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_loc_and_size((0, 0), (8, 8)))];
    output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut surfaces)
        .unwrap();
    assert!(output_renderer.renderbuffer_damage(id).unwrap().is_empty());

    target
        .with_plane(0, |data, stride| {
            assert_eq!(&data[0..3], &[0, 0, 255]);
            let outside = 8 * stride + 8 * 4;
            assert_eq!(&data[outside..outside + 3], &[0, 0, 0]);
        })
        .unwrap();

    let wrong = client_target(16, 16);
    assert!(matches!(
        output_renderer.add_client_target(&mut renderer, wrong, || {}),
        Err(RepaintError::InvalidTarget(_))
    ));
}

#[test]
fn removed_surfaces_damage_their_area() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let mut output_renderer = OutputRenderer::new(output(32, 32));
    let id = output_renderer
        .add_client_target(&mut renderer, client_target(32, 32), || {})
        .unwrap();

    let mut state = SurfaceState::new();
    attach(&mut state, red(8, 8));
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_loc_and_size((4, 4), (8, 8)))];
    output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut surfaces)
        .unwrap();

    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut [])
        .unwrap();
    assert_eq!(
        result.damage,
        Some(vec![Rectangle::from_loc_and_size((4, 4), (8, 8))])
    );
}

#[test]
fn skipped_opaque_surfaces_do_not_hide_old_content() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig {
        fence_timeout: Duration::from_millis(10),
        ..Default::default()
    });
    let mut output_renderer = OutputRenderer::new(output(32, 32));
    let target = client_target(32, 32);
    let id = output_renderer
        .add_client_target(&mut renderer, target.clone(), || {})
        .unwrap();
    let geometry = Rectangle::from_loc_and_size((4, 4), (8, 8));

    let mut first = SurfaceState::new();
    attach(&mut first, red(8, 8));
    let mut surfaces = [RenderSurface::new(&mut first, geometry)];
    output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut surfaces)
        .unwrap();
    assert_eq!(texel(&target, 6, 6), [0, 0, 255]);

    // replaced by an opaque surface whose buffer never becomes ready
    let stalled = FdFence::eventfd(false).unwrap();
    let mut second = SurfaceState::new();
    second.commit(
        Some(
            Attach::new(ClientBuffer::shm(solid(8, 8, Fourcc::Xrgb8888, [255, 0, 0, 255])))
                .with_acquire(stalled.handle().unwrap()),
        ),
        [],
    );
    let mut surfaces = [RenderSurface::new(&mut second, geometry)
        .with_opaque(Region::from_rect(Rectangle::from_size((8, 8))))];
    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut surfaces)
        .unwrap();
    assert_eq!(result.protocol_errors.len(), 1);
    assert_eq!(area(&result.damage), 64);
    assert_eq!(texel(&target, 6, 6), [0, 0, 0]);
}

#[test]
fn opaque_regions_outside_the_visible_area_do_not_hide_content() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let mut output_renderer = OutputRenderer::new(output(32, 32));
    let target = client_target(32, 32);
    let id = output_renderer
        .add_client_target(&mut renderer, target.clone(), || {})
        .unwrap();
    let geometry = Rectangle::from_loc_and_size((0, 0), (16, 16));

    let mut first = SurfaceState::new();
    attach(&mut first, red(16, 16));
    let mut surfaces = [RenderSurface::new(&mut first, geometry)];
    output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut surfaces)
        .unwrap();
    assert_eq!(texel(&target, 12, 4), [0, 0, 255]);

    // only the left half of the replacement is visible, but all of it claims to be opaque
    let mut overlay = SurfaceState::new();
    attach(&mut overlay, solid(16, 16, Fourcc::Argb8888, [0, 0, 0, 0]));
    let mut surfaces = [RenderSurface::new(&mut overlay, geometry)
        .with_visible(Region::from_rect(Rectangle::from_loc_and_size((0, 0), (8, 16))))
        .with_opaque(Region::from_rect(Rectangle::from_size((16, 16))))];
    output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut surfaces)
        .unwrap();

    assert_eq!(texel(&target, 4, 4), [0, 0, 0]);
    assert_eq!(texel(&target, 12, 4), [0, 0, 0]);
}

#[test]
fn every_renderer_uploads_the_damage_it_missed() {
    init_logging();
    const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
    const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
    let fill = |pool: &ShmPool, texel: [u8; 4]| {
        pool.with_data_mut(|memory| {
            for chunk in memory.chunks_exact_mut(4) {
                chunk.copy_from_slice(&texel);
            }
        })
    };

    let pool = ShmPool::create("shared", 8 * 8 * 4).unwrap();
    fill(&pool, [0, 0, 255, 255]);
    let mut state = SurfaceState::new();
    attach(&mut state, ShmBuffer::new(&pool, 0, (8, 8), 32, Fourcc::Xrgb8888));

    let mut renderers = [
        HeadlessRenderer::new(HeadlessConfig::default()),
        HeadlessRenderer::new(HeadlessConfig::default()),
    ];
    let mut windows: Vec<HeadlessSurface> = renderers
        .iter()
        .map(|renderer| HeadlessSurface::new(renderer, (8, 8), Fourcc::Xrgb8888, 2))
        .collect();
    let mut outputs: Vec<OutputRenderer<HeadlessRenderer>> =
        (0..2).map(|_| OutputRenderer::new(output(8, 8))).collect();
    let mut render = |idx: usize, state: &mut SurfaceState| {
        let mut surfaces = [RenderSurface::new(state, Rectangle::from_size((8, 8)))];
        outputs[idx]
            .render_output(&mut renderers[idx], RenderTarget::Window(&mut windows[idx]), &mut surfaces)
            .unwrap();
        let front = windows[idx].front_buffer().unwrap();
        (front.pixel(1, 1), front.pixel(6, 6))
    };

    for idx in 0..2 {
        assert_eq!(render(idx, &mut state), (Some(RED), Some(RED)));
    }

    fill(&pool, [255, 0, 0, 255]);
    damage_buffer(&mut state, rect(0, 0, 8, 8));
    for idx in 0..2 {
        assert_eq!(render(idx, &mut state), (Some(BLUE), Some(BLUE)), "renderer {}", idx);
    }

    // the second renderer misses an update
    fill(&pool, [0, 255, 0, 255]);
    damage_buffer(&mut state, rect(0, 0, 4, 4));
    assert_eq!(render(0, &mut state), (Some(GREEN), Some(BLUE)));
    damage_buffer(&mut state, rect(4, 4, 4, 4));
    assert_eq!(render(0, &mut state), (Some(GREEN), Some(GREEN)));
    assert_eq!(render(1, &mut state), (Some(GREEN), Some(GREEN)));
}

#[test]
fn resizing_discards_supplied_renderbuffers() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = output(800, 600);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let discarded = Rc::new(Cell::new(0));
    let targets = (0..2)
        .map(|_| {
            let discarded = discarded.clone();
            output_renderer
                .add_client_target(&mut renderer, client_target(800, 600), move || {
                    discarded.set(discarded.get() + 1)
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(targets[0]), &mut [])
        .unwrap();
    output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut [])
        .unwrap();
    assert_eq!(discarded.get(), 0);

    output_renderer.set_mode(mode(400, 300));
    assert_eq!(discarded.get(), 2);

    for id in &targets {
        assert!(matches!(
            output_renderer.render_output(&mut renderer, RenderTarget::Buffer(*id), &mut []),
            Err(RepaintError::StaleRenderbuffer(stale)) if stale == *id
        ));
    }

    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut [])
        .unwrap();
    assert_eq!(area(&result.damage), 400 * 300);
    assert_eq!(window.size(), Size::from((400, 300)));

    assert!(output_renderer.remove_target(targets[0]));
    drop(output_renderer);
    assert_eq!(discarded.get(), 2);
}

#[test]
fn window_buffers_are_reused_by_age() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = output(64, 64);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 3);
    let mut output_renderer = OutputRenderer::new(output);

    let mut state = SurfaceState::new();
    attach(&mut state, red(64, 64));
    let updates = [rect(0, 0, 4, 4), rect(8, 0, 4, 4), rect(16, 0, 4, 4), rect(24, 0, 4, 4)];

    let mut damage = Vec::new();
    for update in updates {
        damage_buffer(&mut state, update);
        let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((64, 64)))];
        let result = output_renderer
            .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
            .unwrap();
        damage.push(area(&result.damage));
    }

    // three fresh buffers, then the first one is back with the damage it missed
    assert_eq!(damage, vec![64 * 64, 64 * 64, 64 * 64, 3 * 16]);
    assert_eq!(output_renderer.window_renderbuffers(), 3);
}

#[test]
fn window_buffers_are_refurbished_without_ages() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig {
        buffer_age: false,
        ..Default::default()
    });
    let output = output(32, 32);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let mut state = SurfaceState::new();
    attach(&mut state, red(32, 32));
    for _ in 0..3 {
        damage_buffer(&mut state, rect(0, 0, 2, 2));
        let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((32, 32)))];
        let result = output_renderer
            .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
            .unwrap();
        assert_eq!(area(&result.damage), 32 * 32);
    }
    assert_eq!(output_renderer.window_renderbuffers(), 1);
}

#[test]
fn failed_submissions_keep_their_damage() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig {
        present_failures: 3,
        ..Default::default()
    });
    let output = output(32, 32);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    for failures in 1..=2 {
        let err = output_renderer
            .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut [])
            .unwrap_err();
        assert!(matches!(err, RepaintError::Submit(SwapBuffersError::TemporaryFailure(_))));
        assert_eq!(output_renderer.submit_failures(), failures);
    }
    let err = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut [])
        .unwrap_err();
    assert!(matches!(err, RepaintError::SubmitExhausted(3)));
    assert_eq!(output_renderer.window_renderbuffers(), 1);

    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut [])
        .unwrap();
    assert_eq!(area(&result.damage), 32 * 32);
    assert_eq!(output_renderer.submit_failures(), 0);
    assert_eq!(window.presented(), 1);
}

#[test]
fn debug_tint_damages_everything() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = output(32, 32);
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let mut state = SurfaceState::new();
    attach(&mut state, red(8, 8));
    for _ in 0..2 {
        let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((8, 8)))];
        output_renderer
            .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
            .unwrap();
    }

    renderer.set_debug_flags(DebugFlags::TINT);
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((8, 8)))];
    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
        .unwrap();
    assert_eq!(area(&result.damage), 32 * 32);
    let tinted = window.front_buffer().unwrap().pixel(0, 0).unwrap();
    assert_ne!(tinted, RED);
}

#[test]
fn borders_surround_the_content() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = Output::new(OutputConfig::new("bordered", mode(32, 32)).with_borders(BorderWidths::uniform(4)));
    assert_eq!(output.framebuffer_size(), Size::from((40, 40)));
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let green = solid(1, 1, Fourcc::Xrgb8888, [0, 255, 0, 255]);
    output_renderer.set_border(BorderSide::Top, Some(ClientBuffer::shm(green)));
    output_renderer.set_clear_color(Color32F::new(0.0, 0.0, 1.0, 1.0));

    let mut state = SurfaceState::new();
    attach(&mut state, red(8, 8));
    // placed at the output origin, which is inside the borders
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((8, 8)))];
    output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
        .unwrap();

    let front = window.front_buffer().unwrap();
    assert_eq!(front.pixel(20, 1), Some([0.0, 1.0, 0.0, 1.0]));
    assert_eq!(front.pixel(0, 0), Some([0.0, 1.0, 0.0, 1.0]));
    assert_eq!(front.pixel(1, 20), Some([0.0, 0.0, 1.0, 1.0]));
    assert_eq!(front.pixel(4, 4), Some(RED));
    assert_eq!(front.pixel(20, 20), Some([0.0, 0.0, 1.0, 1.0]));
}

#[derive(Debug, Default)]
struct Handoffs {
    frames: Vec<(bool, Vec<Rectangle<i32, Physical>>)>,
}

#[derive(Debug, Clone, Default)]
struct RecordingTarget(Rc<RefCell<Handoffs>>);

impl ExternalTarget for RecordingTarget {
    fn hand_off(
        &mut self,
        fence: Option<FenceHandle>,
        damage: &[Rectangle<i32, Physical>],
    ) -> Result<(), SwapBuffersError> {
        self.0.borrow_mut().frames.push((fence.is_some(), damage.to_vec()));
        Ok(())
    }
}

#[test]
fn external_targets_are_handed_off_with_a_fence() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let mut output_renderer = OutputRenderer::new(output(16, 16));

    let fd = memfd_create("kiln-target", MemfdFlags::CLOEXEC).unwrap();
    let mut file = File::from(fd);
    file.write_all(&[0; 16 * 16 * 4]).unwrap();
    let memory = file.try_clone().unwrap();
    let mut builder = Dmabuf::builder((16, 16), Fourcc::Xrgb8888, DmabufFlags::empty());
    builder.add_plane(OwnedFd::from(file), 0, 0, 16 * 4, Modifier::Linear);
    let dmabuf = builder.build().unwrap();

    let recorder = RecordingTarget::default();
    let id = output_renderer
        .add_external_target(&mut renderer, dmabuf, recorder.clone(), || {})
        .unwrap();

    let mut state = SurfaceState::new();
    attach(&mut state, red(16, 16));
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((16, 16)))];
    output_renderer
        .render_output(&mut renderer, RenderTarget::Buffer(id), &mut surfaces)
        .unwrap();

    let handoffs = recorder.0.borrow();
    assert_eq!(handoffs.frames.len(), 1);
    assert!(handoffs.frames[0].0);
    assert_eq!(handoffs.frames[0].1, vec![Rectangle::from_size((16, 16))]);

    let mut texel = [0u8; 4];
    memory.read_exact_at(&mut texel, 0).unwrap();
    assert_eq!(&texel[0..3], &[0, 0, 255]);
}

#[test]
fn captures_copy_the_next_frame() {
    init_logging();
    let mut renderer = HeadlessRenderer::new(HeadlessConfig::default());
    let output = Output::new(OutputConfig::new("captured", mode(16, 16)).with_borders(BorderWidths::uniform(2)));
    let mut window = HeadlessSurface::new(&renderer, output.framebuffer_size(), Fourcc::Xrgb8888, 2);
    let mut output_renderer = OutputRenderer::new(output);

    let mut state = SurfaceState::new();
    attach(&mut state, red(4, 4));
    for _ in 0..2 {
        let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((4, 4)))];
        output_renderer
            .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
            .unwrap();
    }

    let results: Rc<RefCell<Vec<Result<(), CaptureError>>>> = Rc::default();
    let content = solid(16, 16, Fourcc::Argb8888, [0; 4]);
    let sink = results.clone();
    output_renderer
        .capture(CaptureSource::Framebuffer, content.clone(), move |result| {
            sink.borrow_mut().push(result)
        })
        .unwrap();
    let sink = results.clone();
    output_renderer
        .capture(CaptureSource::Blending, solid(20, 20, Fourcc::Argb8888, [0; 4]), move |result| {
            sink.borrow_mut().push(result)
        })
        .unwrap();
    assert!(matches!(
        output_renderer.capture(CaptureSource::FullFramebuffer, solid(16, 16, Fourcc::Argb8888, [0; 4]), |_| {}),
        Err(CaptureError::InvalidSize { .. })
    ));
    assert_eq!(output_renderer.pending_captures(), 2);

    // a capture repaints the frame even though nothing changed
    let mut surfaces = [RenderSurface::new(&mut state, Rectangle::from_size((4, 4)))];
    let result = output_renderer
        .render_output(&mut renderer, RenderTarget::Window(&mut window), &mut surfaces)
        .unwrap();
    assert!(!result.is_skipped());
    assert_eq!(output_renderer.pending_captures(), 0);

    let results = results.borrow();
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(CaptureError::NoBlendingBuffer)));
    content
        .with_plane(0, |data, stride| {
            assert_eq!(&data[0..4], &[0, 0, 255, 255]);
            let outside = 4 * stride + 4 * 4;
            assert_eq!(&data[outside..outside + 4], &[0, 0, 0, 255]);
        })
        .unwrap();
}
