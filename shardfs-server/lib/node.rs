//! A storage node owning the files of one shard.
//!
//! A node connection carries exactly one request. The first read decides whether it is a text
//! command or an upload message.

use crate::dispatcher::ConnectionHandler;
use crate::sink::DrainOnError;
use shardfs::archive::{Archiver, build_archive};
use shardfs::command::NodeCommand;
use shardfs::error::{ShardError, ShardResult};
use shardfs::path::LogicalPath;
use shardfs::placement::{SIGNATURE_LEN, ShardId, extension};
use shardfs::protocol::{FrameReader, SizeHeader, copy_exact, write_reply, write_size};
use shardfs::report::{DeleteReply, NodeListing, StoreReply};
use shardfs::storage::DeleteOutcome;
use shardfs::storage::filesystem::FilesystemStorage;
use shardfs::util::close::Close;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct StorageNode {
    shard: ShardId,
    storage: FilesystemStorage,
    archiver: Arc<dyn Archiver>,
}

impl StorageNode {
    pub fn new(shard: ShardId, storage: FilesystemStorage, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            shard,
            storage,
            archiver,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    fn serve(&self, stream: TcpStream) -> ShardResult<()> {
        let mut writer = BufWriter::new(stream.try_clone()?);
        let mut reader = FrameReader::new(stream);
        let is_command = {
            let prefix = reader.sniff()?;
            if prefix.is_empty() {
                return Ok(());
            }
            NodeCommand::is_command_prefix(prefix)
        };
        if !is_command {
            return self.receive_upload(&mut reader, &mut writer);
        }
        let line = reader.read_command()?.unwrap_or_default();
        match NodeCommand::parse(&line) {
            Some(command) => {
                debug!(shard = %self.shard, %command, "received command");
                self.execute(command, &mut writer)
            }
            None => {
                warn!(shard = %self.shard, command = %line, "malformed command");
                Ok(())
            }
        }
    }

    fn execute<W: Write>(&self, command: NodeCommand, writer: &mut W) -> ShardResult<()> {
        match command {
            NodeCommand::GetFile(path) => self.send_file(&path, writer),
            NodeCommand::Delete(path) => {
                let reply = self.delete(&path);
                write_reply(writer, &reply.render(self.shard))?;
                Ok(())
            }
            NodeCommand::List(path) => {
                let listing = self.list(&path);
                write_reply(writer, &listing.render(self.shard))?;
                Ok(())
            }
            NodeCommand::CreateTar(extension) => self.send_archive(&extension, writer),
        }
    }

    fn owns(&self, path: &LogicalPath) -> bool {
        if path.shard() != self.shard {
            warn!(shard = %self.shard, %path, "path carries foreign shard marker");
            return false;
        }
        true
    }

    fn send_file<W: Write>(&self, path: &LogicalPath, writer: &mut W) -> ShardResult<()> {
        if !self.owns(path) {
            write_size(writer, SizeHeader::NotFound)?;
            return Ok(writer.flush()?);
        }
        match self.storage.open(path) {
            Ok((mut file, size)) => {
                info!(shard = %self.shard, %path, size, "sending file");
                write_size(writer, SizeHeader::Found(size))?;
                copy_exact(&mut file, size, writer)?;
            }
            Err(ShardError::NotFound) => {
                info!(shard = %self.shard, %path, "file not found");
                write_size(writer, SizeHeader::NotFound)?;
            }
            Err(err) => {
                error!(shard = %self.shard, %path, "failed to open file: {err}");
                write_size(writer, SizeHeader::NotFound)?;
            }
        }
        Ok(writer.flush()?)
    }

    fn delete(&self, path: &LogicalPath) -> DeleteReply {
        if !self.owns(path) {
            return DeleteReply::Failed;
        }
        match self.storage.delete(path) {
            Ok(DeleteOutcome::Deleted) => {
                info!(shard = %self.shard, %path, "deleted file");
                DeleteReply::Deleted
            }
            Ok(DeleteOutcome::NotFound) => {
                info!(shard = %self.shard, %path, "file to delete not found");
                DeleteReply::NotFound
            }
            Err(err) => {
                error!(shard = %self.shard, %path, "failed to delete file: {err}");
                DeleteReply::Failed
            }
        }
    }

    fn list(&self, path: &LogicalPath) -> NodeListing {
        if !self.owns(path) {
            return NodeListing::DirectoryNotFound;
        }
        match self
            .storage
            .list(path, |name| self.shard.matches_listing(name))
        {
            Ok(names) => NodeListing::Found(names),
            Err(ShardError::NotFound) => {
                debug!(shard = %self.shard, %path, "directory to list not found");
                NodeListing::DirectoryNotFound
            }
            Err(err) => {
                error!(shard = %self.shard, %path, "failed to list directory: {err}");
                NodeListing::DirectoryNotFound
            }
        }
    }

    fn send_archive<W: Write>(&self, extension: &str, writer: &mut W) -> ShardResult<()> {
        if extension != self.shard.extension() || !self.shard.supports_archive() {
            warn!(shard = %self.shard, extension, "cannot archive file type");
            write_size(writer, SizeHeader::NotFound)?;
            return Ok(writer.flush()?);
        }
        let archive = build_archive(
            &self.storage,
            |name| self.shard.matches_listing(name),
            self.archiver.as_ref(),
        )
        .and_then(|artifact| Ok((artifact.open()?, artifact)));
        match archive {
            Ok((mut file, artifact)) => {
                info!(shard = %self.shard, size = artifact.size(), "sending archive");
                write_size(writer, SizeHeader::Found(artifact.size()))?;
                copy_exact(&mut file, artifact.size(), writer)?;
            }
            Err(err) => {
                error!(shard = %self.shard, "failed to build archive: {err}");
                write_size(writer, SizeHeader::NotFound)?;
            }
        }
        Ok(writer.flush()?)
    }

    fn receive_upload<R: Read, W: Write>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut W,
    ) -> ShardResult<()> {
        let header = match reader.read_upload_header() {
            Ok(header) => header,
            Err(err) => {
                warn!(shard = %self.shard, "rejected upload: {err}");
                write_reply(writer, &StoreReply::Rejected(err.to_string()).render(self.shard))?;
                return Ok(());
            }
        };
        let reply = match self.store(&header.dest_path, &header.file_name, header.file_size, reader)
        {
            Ok(path) => {
                info!(shard = %self.shard, %path, size = header.file_size, "stored file");
                StoreReply::Stored
            }
            Err(err) if err.is_fatal_for_connection() => {
                warn!(shard = %self.shard, file = header.file_name, "incomplete upload: {err}");
                return Err(err);
            }
            Err(err) => {
                warn!(shard = %self.shard, file = header.file_name, "rejected upload: {err}");
                StoreReply::Rejected(err.to_string())
            }
        };
        write_reply(writer, &reply.render(self.shard))?;
        Ok(())
    }

    /// Stores an upload payload. The payload is always consumed, even if the file is rejected.
    fn store<R: Read>(
        &self,
        dest_path: &str,
        file_name: &str,
        size: u64,
        reader: &mut FrameReader<R>,
    ) -> ShardResult<LogicalPath> {
        let target = LogicalPath::parse_for(dest_path, self.shard)
            .and_then(|dest| {
                if extension(file_name) != self.shard.extension() {
                    return Err(ShardError::UnsupportedType(file_name.to_string()));
                }
                Ok((dest.join(file_name)?, self.storage.put(&dest, file_name)?))
            });
        let (path, file) = match target {
            Ok(target) => target,
            Err(err) => {
                reader.copy_exact(size, &mut io::sink())?;
                return Err(err);
            }
        };
        let mut sink = DrainOnError::new(file);
        reader.copy_exact(size, &mut sink)?;
        let file = sink.into_result()?;
        let target_path = file.target_path().to_path_buf();
        file.close()?;
        self.check_signature(&path, &target_path, size);
        Ok(path)
    }

    fn check_signature(&self, path: &LogicalPath, target_path: &Path, size: u64) {
        let mut head = Vec::with_capacity(SIGNATURE_LEN);
        let read = File::open(target_path)
            .and_then(|file| file.take(SIGNATURE_LEN as u64).read_to_end(&mut head));
        match read {
            Ok(_) if !self.shard.signature_matches(&head, size) => {
                warn!(shard = %self.shard, %path, "file content does not match its type");
            }
            Ok(_) => {}
            Err(err) => warn!(shard = %self.shard, %path, "cannot check file signature: {err}"),
        }
    }
}

impl ConnectionHandler for StorageNode {
    fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(shard = %self.shard, %peer, "handling request");
        if let Err(err) = self.serve(stream) {
            warn!(shard = %self.shard, %peer, "request failed: {err}");
        }
    }
}
