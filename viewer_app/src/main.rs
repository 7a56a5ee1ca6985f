//! Minimal viewer application
//!
//! Opens a window, wires the Vulkan backend into the deferred-execution
//! renderer, and pumps a clear-pass frame loop with live resize handling.

use ember_engine::core::config::EngineConfig;
use ember_engine::foundation::logging;
use ember_engine::prelude::*;
use ember_engine::render::vulkan::VulkanBackend;
use glfw::{Action, Key, WindowEvent};

const CONFIG_PATH: &str = "viewer.toml";
const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let config = match EngineConfig::from_file(CONFIG_PATH) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("could not load {CONFIG_PATH} ({err}), using defaults");
            EngineConfig::default()
        }
    };

    let mut glfw = glfw::init(glfw::fail_on_errors)?;
    glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
    glfw.window_hint(glfw::WindowHint::Resizable(config.window.resizable));

    let (mut window, events) = glfw
        .create_window(
            config.window.width,
            config.window.height,
            &config.window.title,
            glfw::WindowMode::Windowed,
        )
        .ok_or("failed to create window")?;
    window.set_key_polling(true);
    window.set_framebuffer_size_polling(true);

    let required_extensions = glfw
        .get_required_instance_extensions()
        .ok_or("GLFW reports no Vulkan support")?;

    let (fb_width, fb_height) = window.get_framebuffer_size();
    let release = ReleaseQueues::new(config.renderer.frames_in_flight);
    let backend = VulkanBackend::new(
        &*window,
        (fb_width as u32, fb_height as u32),
        &required_extensions,
        &config.renderer,
        release.clone(),
    )?;
    let renderer = Renderer::new(&config.renderer, Box::new(backend), release)?;
    log::info!("viewer started ({fb_width}x{fb_height})");

    let mut pending_resize: Option<(u32, u32)> = None;
    while !window.should_close() {
        glfw.poll_events();
        for (_, event) in glfw::flush_messages(&events) {
            match event {
                WindowEvent::Key(Key::Escape, _, Action::Press, _) => {
                    window.set_should_close(true);
                }
                WindowEvent::FramebufferSize(width, height) => {
                    pending_resize = Some((width as u32, height as u32));
                }
                _ => {}
            }
        }

        if let Some((width, height)) = pending_resize.take() {
            // A zero extent means the window is minimized; skip the frame
            // and recreate once it is visible again.
            if width == 0 || height == 0 {
                continue;
            }
            renderer.resize(width, height);
        }

        renderer.begin_frame();
        renderer.begin_render_pass(CLEAR_COLOR);
        renderer.end_render_pass();
        renderer.end_frame();
        renderer.wait_and_render();
    }

    renderer.shutdown();
    Ok(())
}
