/// Index of a frame in the buffer manager's arena.
pub type FrameId = u32;

/// Eviction order over the frames whose pin count is zero.
///
/// A frame is tracked from the moment its last pin is released until it is
/// handed out as a victim or pinned again. Frame ids outside the arena are
/// ignored.
pub trait Replacer: Send {
    /// Hand out the next frame to give up its page and stop tracking it.
    ///
    /// Called under the replacer lock. The caller still has to claim the
    /// frame's pin count; a frame that was pinned concurrently is simply
    /// skipped and comes back through [`Replacer::release`].
    fn take_victim(&mut self) -> Option<FrameId>;

    /// The frame's pin count left zero. Called under the replacer lock.
    fn hold(&mut self, frame_id: FrameId);

    /// The frame's pin count dropped back to zero, or a claimed victim was
    /// given back. Called under the replacer lock, after re-checking that
    /// the frame is still unpinned. Releasing a tracked frame again is a
    /// no-op and keeps its position.
    fn release(&mut self, frame_id: FrameId);

    /// Frames that [`Replacer::take_victim`] could hand out right now.
    fn evictable(&self) -> usize;
}
