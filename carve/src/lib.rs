//! Carve renders implicit surfaces on the GPU with adaptive interval
//! subdivision.
//!
//! An **implicit surface** is a function `f(x, y, z)`.  By convention, if
//! `f(x, y, z) < 0`, then that position is **inside** the shape; if it's
//! `> 0`, then that position is **outside** the shape; otherwise, it's on the
//! boundary of the shape.  2D shapes are the same, with `z` ignored.
//!
//! # Tapes
//! Shapes are handed to the GPU as a [`Tape`](crate::tape::Tape): a flat list
//! of register-machine instructions with a fixed binary layout.  The
//! [`compiler`] module builds tapes from textual expressions:
//!
//! ```
//! use carve::compiler::compile;
//!
//! let tape = compile("x^2 + y^2 - 4")?;
//! let bytes = tape.to_bytes();
//! assert_eq!(bytes.len(), 4 + tape.len() * 8);
//! # Ok::<(), carve::compiler::CompileError>(())
//! ```
//!
//! # Subdivision
//! Rendering starts from a single **root region** covering the view.  Each
//! compute pass evaluates the tape over every region of one **generation**
//! using interval arithmetic, after splitting it into a grid of cells.  Cells
//! whose interval result is entirely negative or entirely positive are
//! resolved immediately; ambiguous cells are written to the next generation.
//! The last pass evaluates ambiguous cells per pixel instead.
//!
//! Every generation lives in a preallocated region array whose header doubles
//! as the argument buffer for an indirect dispatch, so a frame runs without
//! any CPU round trips.  The whole pipeline is wrapped up in
//! [`gpu::Renderer`]:
//!
//! ```no_run
//! use carve::{compiler::compile, config::RendererConfig, gpu::Renderer};
//!
//! let mut r = pollster::block_on(Renderer::init(RendererConfig::new_2d()))?;
//! r.set_tape(&compile("x^2 + y^2 - 4")?)?;
//! r.evaluate()?;
//! let rgba = r.read_output()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! 2D surfaces produce a color image (inside and outside colors are part of
//! the [`RendererConfig`](crate::config::RendererConfig)); 3D surfaces produce
//! a depth image, which is shaded for presentation.
#![warn(missing_docs)]

pub mod compiler;
pub mod config;
pub mod gpu;
pub mod tape;
pub mod types;
pub mod view;

mod error;
pub use error::Error;
