//! 服务端 Lua 脚本
//!
//! 脚本都只在单个 Redis 实例上保证原子性, 涉及的键不通过 KEYS 传递, 不适用于集群模式。

use redis::Script;

/// 记录中保存版本号的保留字段
pub const VERSION_FIELD: &str = "__version";

/// ARGV[1] 为期望版本号(空串表示记录必须不存在), 其后为 field/value 对
const COMPARE_AND_SET: &str = r#"
local exists = redis.call('EXISTS', KEYS[1])
local current = redis.call('HGET', KEYS[1], '__version')
if ARGV[1] == '' then
  if exists == 1 then return 0 end
else
  if exists == 0 then return 0 end
  if (current or '0') ~= ARGV[1] then return 0 end
end
local next_version = (tonumber(current) or 0) + 1
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], '__version', tostring(next_version))
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

/// ARGV[1] 为 guard 操作, ARGV[2] 为其余操作数组, 均为 JSON
const EXECUTE_IF: &str = r#"
local function apply(op)
  if op.op == 'list_push' then
    return redis.call('RPUSH', op.key, op.value)
  elseif op.op == 'list_remove' then
    return redis.call('LREM', op.key, 1, op.value)
  elseif op.op == 'sorted_set_add' then
    return redis.call('ZADD', op.key, tostring(op.score), op.member)
  elseif op.op == 'sorted_set_remove' then
    return redis.call('ZREM', op.key, op.member)
  elseif op.op == 'hash_set' then
    return redis.call('HSET', op.key, op.field, op.value)
  elseif op.op == 'hash_delete' then
    return redis.call('HDEL', op.key, op.field)
  elseif op.op == 'hash_compare_and_swap' then
    local current = redis.call('HGET', op.key, op.field)
    local expected = op.expected
    if expected == cjson.null then expected = false end
    if current ~= expected then return 0 end
    if op.value == cjson.null then
      redis.call('HDEL', op.key, op.field)
    else
      redis.call('HSET', op.key, op.field, op.value)
    end
    return 1
  end
  error('unknown store op: ' .. tostring(op.op))
end

local guard = cjson.decode(ARGV[1])
if apply(guard) <= 0 then
  return 0
end
for _, op in ipairs(cjson.decode(ARGV[2])) do
  apply(op)
end
return 1
"#;

/// 单字段比较并交换, 用于 MULTI/EXEC 批量中的条件写入
///
/// ARGV: field, 期望值是否存在("1"/"0"), 期望值, 新值是否存在, 新值
pub const HASH_COMPARE_AND_SWAP: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local expected = false
if ARGV[2] == '1' then expected = ARGV[3] end
if current ~= expected then return 0 end
if ARGV[4] == '1' then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[5])
else
  redis.call('HDEL', KEYS[1], ARGV[1])
end
return 1
"#;

pub fn compare_and_set() -> Script {
    Script::new(COMPARE_AND_SET)
}

pub fn execute_if() -> Script {
    Script::new(EXECUTE_IF)
}
